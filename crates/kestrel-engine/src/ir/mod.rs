//! Register-based intermediate representation
//!
//! Every JIT tier compiles through this IR. Instructions operate on virtual
//! registers with SSA-style operands (each stack temporary has exactly one
//! defining instruction; locals are accessed through explicit load/store),
//! are grouped into basic blocks with explicit terminators, and carry the
//! bytecode offset they were lowered from so deoptimization can map native
//! state back to the interpreter.

pub mod builder;
pub mod display;
pub mod instr;
pub mod types;

pub use builder::{build_ir, BuildError};
pub use display::parse_ir;
pub use instr::{
    BinOp, BlockId, Block, CmpOp, Const, DeoptReason, Instr, IrFunction, Op, Operand, Terminator,
    VReg,
};
pub use types::JsType;
