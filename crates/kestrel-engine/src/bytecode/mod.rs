//! Bytecode: the stack instruction set and its containers
//!
//! A [`Module`] is an ordered set of [`Function`]s sharing a string table and
//! a typed constant pool. The [`Emitter`] lowers the AST contract into
//! bytecode, patching forward jumps through a label table, and optionally
//! runs peephole pre-passes. [`verify::verify_function`] checks the
//! single-valued stack-depth invariant every later stage relies on.

pub mod constants;
pub mod emitter;
pub mod module;
pub mod opcode;
pub mod verify;

pub use constants::{Constant, ConstantPool};
pub use emitter::{EmitError, Emitter, PeepholeLevel};
pub use module::{decode_code, encode_code, DecodeError, ExceptionHandler, Function, Instruction, Module};
pub use opcode::Opcode;
