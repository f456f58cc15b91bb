//! The compile worker pool
//!
//! Workers drain the priority queue and run the shared compile pipeline.
//! They never touch the mutator: artifact publication happens through the
//! code cache's atomic installs. A failed or over-budget compile simply
//! marks the tier state; the function keeps running where it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{CompileError, TierShared};

/// Handle to the running pool.
pub struct CompilePool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<TierShared>,
}

impl CompilePool {
    /// Start `count` workers.
    pub fn start(shared: Arc<TierShared>, count: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("kestrel-compile-{}", id))
                .spawn(move || worker_loop(shared, shutdown))
                .expect("spawn compile worker");
            handles.push(handle);
        }
        CompilePool { shutdown, handles, shared }
    }

    /// Stop the pool, joining every worker.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.shared.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<TierShared>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        let task = match shared.queue.pop_blocking() {
            Some(t) => t,
            None => break, // queue closed
        };
        match shared.compile(&task) {
            Ok(()) | Err(CompileError::Cancelled) => {}
            Err(_) => {
                // Recorded as Failed in the tier state; no immediate retry
            }
        }
        shared.queue.task_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::X64Features;
    use crate::backend::x86_64::X64Backend;
    use crate::bytecode::{Emitter, Module};
    use crate::opt::WellKnownStrings;
    use crate::profiler::Profiler;
    use crate::tier::{CompileState, CompileTask, Tier, TierController, TierPolicy};

    fn simple_module() -> Module {
        use crate::ast::*;
        let program = Program {
            functions: vec![FunctionDecl {
                name: "f".to_string(),
                params: vec![],
                strict: false,
                body: vec![Stmt::Return(Some(Expr::Number(7.0)))],
            }],
            body: vec![],
        };
        Emitter::default().emit_module(&program, "t").unwrap()
    }

    #[test]
    fn test_pool_compiles_queued_task() {
        let profiler = Arc::new(Profiler::new());
        let backend =
            X64Backend::with_features(X64Features { sse2: true, ..Default::default() });
        let controller =
            TierController::new(profiler, Box::new(backend), TierPolicy::default(), 2);
        controller.set_module(Arc::new(simple_module()), WellKnownStrings::default());

        controller
            .shared()
            .queue
            .push(CompileTask::tier_up(1, Tier::Baseline, 100));
        controller.drain();

        let state_cell = controller.shared().state(1);
        let state = state_cell.lock();
        assert_eq!(state.states[Tier::Baseline as usize], CompileState::Completed);
        drop(state);
        assert!(controller.shared().cache.current(1).is_some());
    }

    #[test]
    fn test_cancelled_task_produces_nothing() {
        let profiler = Arc::new(Profiler::new());
        let backend =
            X64Backend::with_features(X64Features { sse2: true, ..Default::default() });
        let controller =
            TierController::new(profiler, Box::new(backend), TierPolicy::default(), 1);
        controller.set_module(Arc::new(simple_module()), WellKnownStrings::default());

        let task = CompileTask::tier_up(1, Tier::Baseline, 100);
        task.cancel();
        controller.shared().queue.push(task);
        controller.drain();
        assert!(controller.shared().cache.current(1).is_none());
    }
}
