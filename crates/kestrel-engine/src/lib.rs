//! Kestrel JavaScript Engine Core
//!
//! This crate provides the execution core of the Kestrel JavaScript engine:
//! - **Bytecode**: stack instruction set, constant pool, emitter (`bytecode` module)
//! - **IR**: register-based SSA-style intermediate representation (`ir` module)
//! - **Optimizer**: backend-agnostic pass pipeline (`opt` module)
//! - **Backends**: x86-64, ARM64, and RISC-V (+RVV) encoders (`backend` module)
//! - **Tier controller**: interpreter → baseline → optimizing → super-optimizing
//!   promotion with OSR and deoptimization (`tier` module)
//! - **GC**: parallel generational garbage collector (`gc` module)
//! - **Interpreter**: profiling bytecode interpreter (`interp` module)
//!
//! The parser producing the AST, the standard library, and the embedding host
//! are intentionally outside this crate; `ast` defines only the contract the
//! bytecode emitter consumes.
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_engine::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! let result = engine.eval_program(program, "main.js")?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// AST contract consumed by the bytecode emitter
pub mod ast;

/// Tagged JavaScript values and coercions
pub mod value;

/// Bytecode: opcodes, modules, emitter, verifier
pub mod bytecode;

/// Register-based intermediate representation
pub mod ir;

/// Execution profiler: hotness, type feedback, call sites
pub mod profiler;

/// IR optimization pass pipeline
pub mod opt;

/// Linear-scan register allocation
pub mod regalloc;

/// Native code generation backends
pub mod backend;

/// Tiered compilation controller
pub mod tier;

/// Generational garbage collector
pub mod gc;

/// Bytecode interpreter
pub mod interp;

mod engine;
pub use engine::{Engine, EngineConfig, EngineError, EngineStats, GcKind};
pub use value::Value;
