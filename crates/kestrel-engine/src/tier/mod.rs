//! Tiered compilation controller
//!
//! Tracks every function's tier and compile state, drives promotion from
//! profiler counters (Interpreter → Baseline → Optimizing →
//! SuperOptimizing), queues compile tasks on a priority queue drained by a
//! worker pool, installs artifacts with an atomic entry swap, handles OSR
//! requests from hot loop back-edges, and runs deoptimization: frame-mapped
//! fallback to the interpreter with cause recording and speculation
//! blacklisting.

pub mod code_cache;
pub mod task;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::backend::{self, Backend, CodegenError};
use crate::bytecode::Module;
use crate::ir::builder::{self, TypeHints};
use crate::ir::instr::DeoptReason;
use crate::opt::{OptLevel, PassCtx, Pipeline, WellKnownStrings};
use crate::profiler::Profiler;
use crate::regalloc;

pub use code_cache::{Artifact, CodeCache};
pub use task::{CompileQueue, CompileTask};
pub use worker::CompilePool;

/// Execution tiers, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tier {
    /// Bytecode interpretation
    Interpreter = 0,
    /// Instruction-level compilation, no IR rewriting
    Baseline = 1,
    /// The medium optimization set
    Optimizing = 2,
    /// Everything, including vectorization and scheduling
    SuperOptimizing = 3,
}

impl Tier {
    /// Optimization level this tier compiles at.
    pub fn opt_level(self) -> OptLevel {
        match self {
            Tier::Interpreter => OptLevel::None,
            Tier::Baseline => OptLevel::Canonicalize,
            Tier::Optimizing => OptLevel::Medium,
            Tier::SuperOptimizing => OptLevel::Full,
        }
    }

    /// The next tier up, if any.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Interpreter => Some(Tier::Baseline),
            Tier::Baseline => Some(Tier::Optimizing),
            Tier::Optimizing => Some(Tier::SuperOptimizing),
            Tier::SuperOptimizing => None,
        }
    }
}

/// Per-tier compile state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileState {
    /// Not attempted
    None,
    /// In the queue
    Queued,
    /// A worker owns it
    Compiling,
    /// Artifact installed
    Completed,
    /// Failed; retried only after the cool-down
    Failed,
    /// Superseded or deoptimized away
    Invalidated,
}

/// Promotion policy thresholds.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    /// Interpreter → Baseline execution count
    pub baseline_threshold: u32,
    /// Baseline → Optimizing execution count
    pub optimizing_threshold: u32,
    /// Dominant-type stability floor for the Optimizing promotion
    pub stability_threshold: f64,
    /// Sustained-hot execution count for SuperOptimizing
    pub super_threshold: u32,
    /// Deopt-free executions required before SuperOptimizing
    pub super_quiet_period: u32,
    /// Back-edge count that queues an OSR compile
    pub osr_entry_threshold: u32,
    /// Per-task wall-clock budget in milliseconds
    pub compile_budget_ms: u64,
    /// Repeated-deopt count that blacklists a speculation site
    pub deopt_blacklist_after: u32,
    /// Inlining depth bound
    pub max_inline_depth: u32,
    /// Per-callee inlining size bound (IR instructions)
    pub max_inline_size: u32,
}

impl Default for TierPolicy {
    fn default() -> Self {
        TierPolicy {
            baseline_threshold: 100,
            optimizing_threshold: 10_000,
            stability_threshold: 0.8,
            super_threshold: 100_000,
            super_quiet_period: 10_000,
            osr_entry_threshold: 1_000,
            compile_budget_ms: 50,
            deopt_blacklist_after: 3,
            max_inline_depth: 5,
            max_inline_size: 1_000,
        }
    }
}

/// Compilation errors surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    /// IR construction failed (emitter bug; fatal upstream)
    #[error(transparent)]
    Build(#[from] builder::BuildError),
    /// The backend rejected the function
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    /// The task exceeded its wall-clock budget
    #[error("compile budget of {0} ms exceeded")]
    BudgetExceeded(u64),
    /// The task was cancelled
    #[error("compile task cancelled")]
    Cancelled,
}

/// Per-function tier state.
#[derive(Debug)]
pub struct FunctionTierState {
    /// Current execution tier
    pub tier: Tier,
    /// Per-tier compile states (indexed by tier)
    pub states: [CompileState; 4],
    /// Per-tier code sizes
    pub code_size: [usize; 4],
    /// Per-tier compile times in nanoseconds
    pub compile_ns: [u64; 4],
    /// Functions inlined into this one
    pub inlined_functions: Vec<u32>,
    /// Callers this function was inlined into
    pub inlined_into: Vec<u32>,
    /// A deopt has been requested but not yet taken
    pub pending_deopt: bool,
    /// (bytecode offset, cause) → remaining cool-down
    pub blacklist: FxHashMap<(u32, DeoptReason), u32>,
}

impl Default for FunctionTierState {
    fn default() -> Self {
        FunctionTierState {
            tier: Tier::Interpreter,
            states: [CompileState::None; 4],
            code_size: [0; 4],
            compile_ns: [0; 4],
            inlined_functions: Vec::new(),
            inlined_into: Vec::new(),
            pending_deopt: false,
            blacklist: FxHashMap::default(),
        }
    }
}

/// State shared between the controller facade and the compile workers.
pub struct TierShared {
    /// The module being executed
    pub module: Mutex<Option<Arc<Module>>>,
    /// The profiler feeding promotion and specialization
    pub profiler: Arc<Profiler>,
    /// The selected backend
    pub backend: Box<dyn Backend>,
    /// Installed artifacts
    pub cache: CodeCache,
    /// Pending compile tasks
    pub queue: CompileQueue,
    /// Policy knobs
    pub policy: TierPolicy,
    /// Per-function tier state
    states: DashMap<u32, Arc<Mutex<FunctionTierState>>>,
    /// Monotone artifact generation counter
    generation: AtomicU64,
    /// Interned typeof strings for the optimizer
    pub well_known: Mutex<WellKnownStrings>,
}

impl TierShared {
    /// State cell for a function.
    pub fn state(&self, func_index: u32) -> Arc<Mutex<FunctionTierState>> {
        self.states
            .entry(func_index)
            .or_insert_with(|| Arc::new(Mutex::new(FunctionTierState::default())))
            .clone()
    }

    /// Next artifact generation.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Compile one task through the full pipeline. Runs on a worker or, as
    /// the fallback, on the caller's thread.
    pub fn compile(&self, task: &CompileTask) -> Result<(), CompileError> {
        if task.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        let started = Instant::now();
        let budget = std::time::Duration::from_millis(self.policy.compile_budget_ms);
        let state_cell = self.state(task.func_index);
        {
            let mut state = state_cell.lock();
            state.states[task.target_tier as usize] = CompileState::Compiling;
        }

        let result = self.compile_inner(task, started, budget);
        let mut state = state_cell.lock();
        match &result {
            Ok(()) => {
                state.states[task.target_tier as usize] = CompileState::Completed;
                state.tier = state.tier.max(task.target_tier);
                state.compile_ns[task.target_tier as usize] =
                    started.elapsed().as_nanos() as u64;
            }
            Err(_) => {
                state.states[task.target_tier as usize] = CompileState::Failed;
            }
        }
        result
    }

    fn compile_inner(
        &self,
        task: &CompileTask,
        started: Instant,
        budget: std::time::Duration,
    ) -> Result<(), CompileError> {
        let module = match self.module.lock().clone() {
            Some(m) => m,
            None => return Err(CompileError::Cancelled),
        };
        let func = match module.functions.get(task.func_index as usize) {
            Some(f) => f.clone(),
            None => return Err(CompileError::Cancelled),
        };

        // Type hints from the profiler, filtered by the stability floor
        let profile = self.profiler.function(task.func_index);
        let hints = TypeHints { by_offset: profile.type_hints(self.policy.stability_threshold) };

        let mut ir = builder::build_ir(&func, &module, task.func_index, &hints)?;

        if task.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        if started.elapsed() > budget {
            return Err(CompileError::BudgetExceeded(self.policy.compile_budget_ms));
        }

        let pipeline = Pipeline::for_level(task.target_tier.opt_level());
        let ctx = PassCtx {
            feedback: Some(profile),
            stability_threshold: self.policy.stability_threshold,
            target: self.backend.arch(),
            strings: *self.well_known.lock(),
        };
        pipeline.optimize(&mut ir, &ctx);

        if task.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        if started.elapsed() > budget {
            return Err(CompileError::BudgetExceeded(self.policy.compile_budget_ms));
        }

        backend::eliminate_phis(&mut ir);
        backend::lower_generic_ops(&mut ir);
        let alloc = regalloc::allocate(&ir, &self.backend.allocatable());
        let blob = self.backend.emit_function(&ir, &alloc)?;

        let generation = self.next_generation();
        let size = blob.code.len();
        self.cache.install(task.func_index, task.target_tier, blob, generation)?;

        let state_cell = self.state(task.func_index);
        state_cell.lock().code_size[task.target_tier as usize] = size;
        Ok(())
    }
}

/// The controller facade the interpreter talks to.
pub struct TierController {
    shared: Arc<TierShared>,
    pool: Option<CompilePool>,
}

impl TierController {
    /// Controller with the host backend and `threads` compile workers
    /// (0 = cores − 1).
    pub fn new(
        profiler: Arc<Profiler>,
        backend: Box<dyn Backend>,
        policy: TierPolicy,
        threads: usize,
    ) -> Self {
        let shared = Arc::new(TierShared {
            module: Mutex::new(None),
            profiler,
            backend,
            cache: CodeCache::new(),
            queue: CompileQueue::new(),
            policy,
            states: DashMap::new(),
            generation: AtomicU64::new(0),
            well_known: Mutex::new(WellKnownStrings::default()),
        });
        let worker_count = if threads > 0 {
            threads
        } else {
            num_cpus::get().saturating_sub(1).max(1)
        };
        let pool = CompilePool::start(shared.clone(), worker_count);
        TierController { shared, pool: Some(pool) }
    }

    /// A controller with no worker pool: every compile runs synchronously on
    /// the caller (tests, single-threaded embedders).
    pub fn synchronous(
        profiler: Arc<Profiler>,
        backend: Box<dyn Backend>,
        policy: TierPolicy,
    ) -> Self {
        let shared = Arc::new(TierShared {
            module: Mutex::new(None),
            profiler,
            backend,
            cache: CodeCache::new(),
            queue: CompileQueue::new(),
            policy,
            states: DashMap::new(),
            generation: AtomicU64::new(0),
            well_known: Mutex::new(WellKnownStrings::default()),
        });
        TierController { shared, pool: None }
    }

    /// Shared state handle.
    pub fn shared(&self) -> &Arc<TierShared> {
        &self.shared
    }

    /// Install the module under execution.
    pub fn set_module(&self, module: Arc<Module>, well_known: WellKnownStrings) {
        *self.shared.module.lock() = Some(module);
        *self.shared.well_known.lock() = well_known;
    }

    /// Current tier of a function.
    pub fn tier_of(&self, func_index: u32) -> Tier {
        self.shared.state(func_index).lock().tier
    }

    /// Per-call-site dispatch: record the execution and drive promotion.
    /// Returns the installed artifact when the function has compiled code
    /// (dispatching through it is feature-gated in the engine).
    pub fn on_function_entry(&self, func_index: u32) -> Option<Arc<Artifact>> {
        let count = self.shared.profiler.record_execution(func_index);
        self.consider_promotion(func_index, count);
        let state = self.shared.state(func_index);
        let tier = state.lock().tier;
        if tier > Tier::Interpreter {
            self.shared.cache.current(func_index)
        } else {
            None
        }
    }

    /// Back-edge notification from the interpreter; queues an OSR compile
    /// once the loop is hot.
    pub fn on_back_edge(&self, func_index: u32, header_offset: u32) {
        let count = self.shared.profiler.record_back_edge(func_index, header_offset);
        if count == self.shared.policy.osr_entry_threshold {
            let state_cell = self.shared.state(func_index);
            let mut state = state_cell.lock();
            let target = state.tier.next().unwrap_or(Tier::SuperOptimizing);
            if state.states[target as usize] == CompileState::None {
                state.states[target as usize] = CompileState::Queued;
                drop(state);
                // OSR tasks outrank every plain tier-up in the queue
                self.submit(CompileTask::osr(func_index, target, header_offset));
            }
        }
    }

    /// Promotion policy.
    fn consider_promotion(&self, func_index: u32, exec_count: u32) {
        let policy = &self.shared.policy;
        let state_cell = self.shared.state(func_index);
        let mut state = state_cell.lock();
        let target = match state.tier {
            Tier::Interpreter if exec_count >= policy.baseline_threshold => Tier::Baseline,
            Tier::Baseline
                if exec_count >= policy.optimizing_threshold
                    && self.shared.profiler.overall_stability(func_index)
                        >= policy.stability_threshold =>
            {
                Tier::Optimizing
            }
            Tier::Optimizing
                if self.shared.profiler.sustained_hot(
                    func_index,
                    policy.super_threshold,
                    policy.super_quiet_period,
                ) =>
            {
                Tier::SuperOptimizing
            }
            _ => return,
        };
        if state.states[target as usize] != CompileState::None {
            return;
        }
        state.states[target as usize] = CompileState::Queued;
        drop(state);
        self.submit(CompileTask::tier_up(func_index, target, exec_count));
    }

    /// Queue a task, or compile on this thread when no pool exists
    /// (main-thread compilation is always available as the fallback).
    fn submit(&self, task: CompileTask) {
        match &self.pool {
            Some(_) => self.shared.queue.push(task),
            None => {
                let _ = self.shared.compile(&task);
            }
        }
    }

    /// Wait until the queue drains (tests and shutdown).
    pub fn drain(&self) {
        if self.pool.is_some() {
            self.shared.queue.wait_idle();
        }
    }

    /// OSR entry for a loop, if the current artifact carries one.
    pub fn osr_entry(&self, func_index: u32, bytecode_offset: u32) -> Option<usize> {
        let artifact = self.shared.cache.current(func_index)?;
        artifact.osr_native_offset(bytecode_offset)
    }

    /// Deoptimize: record the cause, lower the tier to Baseline, blacklist
    /// the speculation site after repeated failures, and invalidate the
    /// optimized artifacts. The interpreter resumes from its reconstructed
    /// frame.
    pub fn deoptimize(&self, func_index: u32, bytecode_offset: u32, reason: DeoptReason) {
        self.shared.profiler.record_deopt(func_index, bytecode_offset, reason);

        let state_cell = self.shared.state(func_index);
        let mut state = state_cell.lock();
        state.pending_deopt = false;
        if state.tier > Tier::Baseline {
            state.tier = Tier::Baseline;
        }
        for t in [Tier::Optimizing, Tier::SuperOptimizing] {
            if state.states[t as usize] == CompileState::Completed {
                state.states[t as usize] = CompileState::Invalidated;
            }
        }
        let deopts = self
            .shared
            .profiler
            .function(func_index)
            .deopt_count_for(bytecode_offset, reason);
        if deopts >= self.shared.policy.deopt_blacklist_after {
            state
                .blacklist
                .insert((bytecode_offset, reason), self.shared.policy.deopt_blacklist_after);
        }
        drop(state);

        self.shared.cache.invalidate_above(func_index, Tier::Baseline);
    }

    /// Whether a speculation at this site is blacklisted.
    pub fn is_blacklisted(&self, func_index: u32, bytecode_offset: u32, reason: DeoptReason) -> bool {
        self.shared
            .state(func_index)
            .lock()
            .blacklist
            .contains_key(&(bytecode_offset, reason))
    }

    /// Record that `callee` was inlined into `caller`.
    pub fn mark_inlined(&self, caller: u32, callee: u32) {
        self.shared.state(caller).lock().inlined_functions.push(callee);
        self.shared.state(callee).lock().inlined_into.push(caller);
    }

    /// Whether the policy admits inlining `callee` into `caller`.
    pub fn can_inline(&self, caller: u32, callee: u32, callee_size: u32, depth: u32) -> bool {
        caller != callee
            && depth < self.shared.policy.max_inline_depth
            && callee_size <= self.shared.policy.max_inline_size
    }

    /// Invalidate a function and every caller that embedded assumptions
    /// about it. Entries are redirected to the interpreter immediately; code
    /// memory is released only once no frame can reference it.
    pub fn invalidate(&self, func_index: u32) {
        let callers = {
            let state_cell = self.shared.state(func_index);
            let mut state = state_cell.lock();
            state.tier = Tier::Interpreter;
            for s in state.states.iter_mut() {
                if *s == CompileState::Completed {
                    *s = CompileState::Invalidated;
                }
            }
            state.inlined_into.clone()
        };
        self.shared.cache.invalidate_above(func_index, Tier::Interpreter);
        for caller in callers {
            self.invalidate(caller);
        }
    }

    /// Frames observed at a safepoint: artifacts retired before the oldest
    /// still-referenced generation can be released.
    pub fn release_retired(&self, oldest_live_generation: u64) -> usize {
        self.shared.cache.release_retired(oldest_live_generation)
    }

    /// Snapshot for stats.
    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats::default();
        for entry in self.shared.states.iter() {
            let state = entry.value().lock();
            match state.tier {
                Tier::Interpreter => stats.interpreter += 1,
                Tier::Baseline => stats.baseline += 1,
                Tier::Optimizing => stats.optimizing += 1,
                Tier::SuperOptimizing => stats.super_optimizing += 1,
            }
        }
        stats.installed_artifacts = self.shared.cache.installed();
        stats.retired_artifacts = self.shared.cache.retired();
        stats
    }
}

impl Drop for TierController {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop();
        }
    }
}

/// Tier distribution snapshot.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TierStats {
    /// Functions still interpreted
    pub interpreter: usize,
    /// Functions at Baseline
    pub baseline: usize,
    /// Functions at Optimizing
    pub optimizing: usize,
    /// Functions at SuperOptimizing
    pub super_optimizing: usize,
    /// Live artifacts
    pub installed_artifacts: usize,
    /// Artifacts awaiting frame drain
    pub retired_artifacts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::bytecode::Emitter;

    fn controller_with_loop_module() -> TierController {
        // function hot(n) { let i = 0; while (i < n) { i = i + 1; } return i; }
        let program = Program {
            functions: vec![FunctionDecl {
                name: "hot".to_string(),
                params: vec!["n".to_string()],
                strict: false,
                body: vec![
                    Stmt::Let { name: "i".to_string(), init: Some(Expr::Number(0.0)) },
                    Stmt::While {
                        cond: Expr::Binary {
                            op: BinaryOp::Lt,
                            left: Box::new(Expr::Ident("i".to_string())),
                            right: Box::new(Expr::Ident("n".to_string())),
                        },
                        body: vec![Stmt::Assign {
                            target: "i".to_string(),
                            value: Expr::Binary {
                                op: BinaryOp::Add,
                                left: Box::new(Expr::Ident("i".to_string())),
                                right: Box::new(Expr::Number(1.0)),
                            },
                        }],
                    },
                    Stmt::Return(Some(Expr::Ident("i".to_string()))),
                ],
            }],
            body: vec![],
        };
        let module = Emitter::default().emit_module(&program, "test").unwrap();
        let profiler = Arc::new(Profiler::new());
        let backend = crate::backend::x86_64::X64Backend::with_features(
            crate::backend::cpu::X64Features { sse2: true, ..Default::default() },
        );
        let controller =
            TierController::synchronous(profiler, Box::new(backend), TierPolicy::default());
        controller.set_module(Arc::new(module), WellKnownStrings::default());
        controller
    }

    #[test]
    fn test_promotion_to_baseline_at_threshold() {
        let c = controller_with_loop_module();
        for _ in 0..99 {
            c.on_function_entry(1);
        }
        assert_eq!(c.tier_of(1), Tier::Interpreter);
        c.on_function_entry(1); // 100th
        assert!(c.tier_of(1) >= Tier::Baseline);
        assert!(c.shared.cache.current(1).is_some());
    }

    #[test]
    fn test_osr_task_queued_at_backedge_threshold() {
        let c = controller_with_loop_module();
        let header = {
            let module = c.shared.module.lock().clone().unwrap();
            // Find the loop header: target of the backward jump
            module.functions[1]
                .code
                .iter()
                .enumerate()
                .find_map(|(i, ins)| {
                    (ins.opcode == crate::bytecode::Opcode::Jump && (ins.a as usize) <= i)
                        .then_some(ins.a)
                })
                .unwrap()
        };
        for _ in 0..1000 {
            c.on_back_edge(1, header);
        }
        // Synchronous controller compiled immediately; the artifact carries
        // an OSR entry for the header
        assert!(c.osr_entry(1, header).is_some());
    }

    #[test]
    fn test_deopt_lowers_tier_and_blacklists() {
        let c = controller_with_loop_module();
        for _ in 0..10_000 {
            c.on_function_entry(1);
        }
        assert!(c.tier_of(1) >= Tier::Optimizing);

        for _ in 0..3 {
            c.deoptimize(1, 4, DeoptReason::TypeInstability);
        }
        assert_eq!(c.tier_of(1), Tier::Baseline);
        assert!(c.is_blacklisted(1, 4, DeoptReason::TypeInstability));
        // Optimized artifacts invalidated; baseline remains current
        let current = c.shared.cache.current(1).unwrap();
        assert!(current.tier <= Tier::Baseline);
    }

    #[test]
    fn test_invalidate_cascades_to_callers() {
        let c = controller_with_loop_module();
        for _ in 0..200 {
            c.on_function_entry(0);
            c.on_function_entry(1);
        }
        c.mark_inlined(0, 1);
        c.invalidate(1);
        assert_eq!(c.tier_of(0), Tier::Interpreter);
        assert_eq!(c.tier_of(1), Tier::Interpreter);
    }

    #[test]
    fn test_inline_policy_bounds() {
        let c = controller_with_loop_module();
        assert!(c.can_inline(0, 1, 100, 0));
        assert!(!c.can_inline(0, 0, 100, 0)); // self
        assert!(!c.can_inline(0, 1, 100_000, 0)); // too big
        assert!(!c.can_inline(0, 1, 100, 5)); // too deep
    }
}
