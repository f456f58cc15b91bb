//! The embedding API
//!
//! One [`Engine`] is one realm: its own heap, profiler, tier controller, and
//! globals. The surface is small: evaluate a program, load a module, read and
//! write globals, request a collection, snapshot stats.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::ast::Program;
use crate::backend;
use crate::bytecode::{EmitError, Emitter, Module, PeepholeLevel};
use crate::gc::{CollectionKind, Gc, GcCause, GcConfig, GcStats};
use crate::interp::{ExecEnv, Interpreter, VmError};
use crate::opt::WellKnownStrings;
use crate::profiler::Profiler;
use crate::tier::{TierController, TierPolicy, TierStats};
use crate::value::Value;

/// Engine configuration. Every knob is independent; `Default` is the
/// production profile.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interpreter → Baseline execution-count threshold
    pub tier_up_baseline_threshold: u32,
    /// Baseline → Optimizing execution-count threshold
    pub tier_up_optimizing_threshold: u32,
    /// Sustained-hot threshold for Optimizing → SuperOptimizing
    pub tier_up_super_threshold: u32,
    /// Back-edge count that triggers an OSR compile
    pub osr_entry_threshold: u32,
    /// Compile pool size (0 = cores − 1)
    pub jit_compile_threads: usize,
    /// Run every compile on the requesting thread (tests, constrained hosts)
    pub jit_synchronous: bool,
    /// Per-task compile budget in milliseconds
    pub jit_compile_budget_ms: u64,
    /// Inlining depth bound
    pub jit_max_inline_depth: u32,
    /// Per-callee inlining size bound
    pub jit_max_inline_size: u32,
    /// Minimum type stability for specialization
    pub profile_stability_threshold: f64,
    /// Nursery size in bytes
    pub gc_nursery_size: usize,
    /// Young generation size in bytes
    pub gc_young_size: usize,
    /// Medium generation size in bytes
    pub gc_medium_size: usize,
    /// Hard heap cap in bytes
    pub gc_max_heap_size: usize,
    /// Large-object threshold in bytes
    pub gc_large_object_threshold: usize,
    /// Parallel marking on the worker pool
    pub gc_enable_concurrent_mark: bool,
    /// Background dropping of dead payloads
    pub gc_enable_concurrent_sweep: bool,
    /// Old-generation compaction in major cycles
    pub gc_enable_compaction: bool,
    /// Per-generation survival counts before promotion
    pub gc_promotion_ages: [u8; 3],
    /// Maximum interpreter call depth
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tier_up_baseline_threshold: 100,
            tier_up_optimizing_threshold: 10_000,
            tier_up_super_threshold: 100_000,
            osr_entry_threshold: 1_000,
            jit_compile_threads: 0,
            jit_synchronous: false,
            jit_compile_budget_ms: 50,
            jit_max_inline_depth: 5,
            jit_max_inline_size: 1_000,
            profile_stability_threshold: 0.8,
            gc_nursery_size: 2 * 1024 * 1024,
            gc_young_size: 16 * 1024 * 1024,
            gc_medium_size: 64 * 1024 * 1024,
            gc_max_heap_size: 4 * 1024 * 1024 * 1024,
            gc_large_object_threshold: 32 * 1024,
            gc_enable_concurrent_mark: true,
            gc_enable_concurrent_sweep: true,
            gc_enable_compaction: true,
            gc_promotion_ages: [1, 3, 5],
            max_call_depth: 1024,
        }
    }
}

/// Collection request kinds for `request_gc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Nursery + young
    Minor,
    /// Everything through the medium generation
    Major,
    /// All generations, compaction included
    Full,
}

/// Engine-surface errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The program failed to lower to bytecode
    #[error(transparent)]
    Emit(#[from] EmitError),
    /// Runtime failure
    #[error(transparent)]
    Vm(#[from] VmError),
    /// No module has been loaded
    #[error("no module loaded")]
    NoModule,
    /// Unknown function name
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
}

/// Introspection snapshot: `{ gc, jit, profiler }`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Collector counters
    pub gc: GcStats,
    /// Tier distribution and artifact counts
    pub jit: TierStats,
    /// Profiler coverage
    pub profiler: ProfilerStats,
}

/// Profiler counters for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ProfilerStats {
    /// Functions with any recorded data
    pub profiled_functions: usize,
    /// Lifetime deoptimizations
    pub total_deopts: u64,
}

/// A JavaScript engine realm.
pub struct Engine {
    config: EngineConfig,
    gc: Gc,
    profiler: Arc<Profiler>,
    tier: TierController,
    interp: Interpreter,
    globals: FxHashMap<Arc<str>, Value>,
    module: Option<Arc<Module>>,
}

impl Engine {
    /// Create a realm.
    pub fn new(config: EngineConfig) -> Self {
        let gc = Gc::new(GcConfig {
            nursery_size: config.gc_nursery_size,
            young_size: config.gc_young_size,
            medium_size: config.gc_medium_size,
            max_heap_size: config.gc_max_heap_size,
            large_object_threshold: config.gc_large_object_threshold,
            promotion_ages: config.gc_promotion_ages,
            worker_threads: 0,
            enable_concurrent_sweep: config.gc_enable_concurrent_sweep,
            enable_concurrent_mark: config.gc_enable_concurrent_mark,
            enable_compaction: config.gc_enable_compaction,
            ..Default::default()
        });
        let profiler = Arc::new(Profiler::new());
        let policy = TierPolicy {
            baseline_threshold: config.tier_up_baseline_threshold,
            optimizing_threshold: config.tier_up_optimizing_threshold,
            super_threshold: config.tier_up_super_threshold,
            stability_threshold: config.profile_stability_threshold,
            osr_entry_threshold: config.osr_entry_threshold,
            compile_budget_ms: config.jit_compile_budget_ms,
            max_inline_depth: config.jit_max_inline_depth,
            max_inline_size: config.jit_max_inline_size,
            ..Default::default()
        };
        let backend = backend::host_backend().unwrap_or_else(|| {
            // Cross-emission fallback: encode for the reference target even
            // when the host cannot execute it
            Box::new(backend::x86_64::X64Backend::with_features(
                backend::cpu::X64Features { sse2: true, ..Default::default() },
            ))
        });
        let tier = if config.jit_synchronous {
            TierController::synchronous(profiler.clone(), backend, policy)
        } else {
            TierController::new(profiler.clone(), backend, policy, config.jit_compile_threads)
        };
        let interp = Interpreter { max_call_depth: config.max_call_depth };
        Engine {
            config,
            gc,
            profiler,
            tier,
            interp,
            globals: FxHashMap::default(),
            module: None,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile a program into this realm without running it.
    pub fn load_module(&mut self, program: &Program, name: &str) -> Result<(), EngineError> {
        let mut module = Emitter::new(PeepholeLevel::Full).emit_module(program, name)?;
        let well_known = WellKnownStrings {
            undefined_: module.strings.intern("undefined"),
            object_: module.strings.intern("object"),
            boolean_: module.strings.intern("boolean"),
            number_: module.strings.intern("number"),
            string_: module.strings.intern("string"),
            function_: module.strings.intern("function"),
        };
        let module = Arc::new(module);
        self.tier.set_module(module.clone(), well_known);
        self.module = Some(module);
        Ok(())
    }

    /// Evaluate a program: load it and run the synthetic main.
    pub fn eval_program(&mut self, program: &Program, name: &str) -> Result<Value, EngineError> {
        self.load_module(program, name)?;
        self.call_index(0, Vec::new())
    }

    /// Call a loaded function by name.
    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        let module = self.module.clone().ok_or(EngineError::NoModule)?;
        let index = module
            .functions
            .iter()
            .position(|f| {
                module
                    .strings
                    .get(f.name)
                    .map(|n| n.as_ref() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| EngineError::UnknownFunction(name.to_string()))?;
        self.call_index(index as u32, args)
    }

    fn call_index(&mut self, func_index: u32, args: Vec<Value>) -> Result<Value, EngineError> {
        let module = self.module.clone().ok_or(EngineError::NoModule)?;
        let mut env = ExecEnv {
            module: &module,
            globals: &mut self.globals,
            gc: &mut self.gc,
            tier: &self.tier,
        };
        Ok(self.interp.run(&mut env, func_index, args)?)
    }

    /// Set a global binding.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.into(), value);
        if let Some(r) = self.globals.get(name).and_then(|v| v.as_object()) {
            self.gc.roots().add(r);
        }
    }

    /// Read a global binding.
    pub fn get_global(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Undefined)
    }

    /// Request a collection.
    pub fn request_gc(&mut self, kind: GcKind) {
        let kind = match kind {
            GcKind::Minor => CollectionKind::Minor,
            GcKind::Major => CollectionKind::Medium,
            GcKind::Full => CollectionKind::Major,
        };
        self.root_globals();
        self.gc.collect(kind, GcCause::ExplicitRequest);
        self.unroot_globals();
    }

    /// Stats snapshot suitable for serialization.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            gc: self.gc.stats().clone(),
            jit: self.tier.stats(),
            profiler: ProfilerStats {
                profiled_functions: self.profiler.profiled_function_count(),
                total_deopts: self.profiler.total_deopts(),
            },
        }
    }

    /// The tier controller (tests and embedder introspection).
    pub fn tier(&self) -> &TierController {
        &self.tier
    }

    /// The collector (tests and embedder introspection).
    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    /// Wait for queued compiles to finish (deterministic tests).
    pub fn drain_compiles(&self) {
        self.tier.drain();
    }

    fn root_globals(&mut self) {
        let refs: Vec<_> = self.globals.values().filter_map(|v| v.as_object()).collect();
        for r in refs {
            self.gc.roots().add(r);
        }
    }

    fn unroot_globals(&mut self) {
        let refs: Vec<_> = self.globals.values().filter_map(|v| v.as_object()).collect();
        for r in refs {
            self.gc.roots().remove(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            jit_synchronous: true,
            gc_enable_concurrent_sweep: false,
            ..Default::default()
        }
    }

    fn num(n: f64) -> Expr {
        Expr::Number(n)
    }

    #[test]
    fn test_eval_returns_value() {
        let mut engine = Engine::new(test_config());
        let program = Program {
            functions: vec![],
            body: vec![Stmt::Return(Some(Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(num(5.0)),
                right: Box::new(num(10.0)),
            }))],
        };
        let result = engine.eval_program(&program, "test.js").unwrap();
        assert!(matches!(result, Value::Number(n) if n == 15.0));
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut engine = Engine::new(test_config());
        engine.set_global("answer", Value::Number(42.0));
        assert!(matches!(engine.get_global("answer"), Value::Number(n) if n == 42.0));
        assert!(matches!(engine.get_global("missing"), Value::Undefined));

        // Program reads the global
        let program = Program {
            functions: vec![],
            body: vec![Stmt::Return(Some(Expr::Ident("answer".to_string())))],
        };
        let result = engine.eval_program(&program, "g.js").unwrap();
        assert!(matches!(result, Value::Number(n) if n == 42.0));
    }

    #[test]
    fn test_call_function_by_name() {
        let mut engine = Engine::new(test_config());
        let program = Program {
            functions: vec![FunctionDecl {
                name: "double".to_string(),
                params: vec!["x".to_string()],
                strict: false,
                body: vec![Stmt::Return(Some(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(Expr::Ident("x".to_string())),
                    right: Box::new(num(2.0)),
                }))],
            }],
            body: vec![],
        };
        engine.load_module(&program, "m.js").unwrap();
        let result = engine.call_function("double", vec![Value::Number(21.0)]).unwrap();
        assert!(matches!(result, Value::Number(n) if n == 42.0));
    }

    #[test]
    fn test_uncaught_throw_surfaces() {
        let mut engine = Engine::new(test_config());
        let program = Program {
            functions: vec![],
            body: vec![Stmt::Throw(Expr::String("boom".to_string()))],
        };
        let err = engine.eval_program(&program, "t.js").unwrap_err();
        assert!(matches!(err, EngineError::Vm(VmError::Thrown(_))));
    }

    #[test]
    fn test_try_catch_recovers() {
        let mut engine = Engine::new(test_config());
        let program = Program {
            functions: vec![],
            body: vec![Stmt::Try {
                body: vec![Stmt::Throw(num(7.0))],
                catch_var: Some("e".to_string()),
                catch_body: vec![Stmt::Return(Some(Expr::Ident("e".to_string())))],
                finally_body: vec![],
            }],
        };
        let result = engine.eval_program(&program, "t.js").unwrap();
        assert!(matches!(result, Value::Number(n) if n == 7.0));
    }

    #[test]
    fn test_request_gc_updates_stats() {
        let mut engine = Engine::new(test_config());
        engine.request_gc(GcKind::Minor);
        engine.request_gc(GcKind::Full);
        let stats = engine.stats();
        assert_eq!(stats.gc.collections, 2);
        // The whole snapshot serializes for embedders
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"gc\""));
        assert!(json.contains("\"jit\""));
    }

    #[test]
    fn test_stack_overflow_reported() {
        let mut engine = Engine::new(test_config());
        let program = Program {
            functions: vec![FunctionDecl {
                name: "loop_forever".to_string(),
                params: vec![],
                strict: false,
                body: vec![Stmt::Return(Some(Expr::Call {
                    callee: "loop_forever".to_string(),
                    args: vec![],
                }))],
            }],
            body: vec![Stmt::Return(Some(Expr::Call {
                callee: "loop_forever".to_string(),
                args: vec![],
            }))],
        };
        let err = engine.eval_program(&program, "so.js").unwrap_err();
        assert!(matches!(err, EngineError::Vm(VmError::StackOverflow)));
    }
}
