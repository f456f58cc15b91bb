//! Native code generation backends
//!
//! Each backend is a pure encoder from IR plus a register assignment to
//! machine code bytes and artifact metadata. The shared pieces live here:
//! the [`Backend`] trait the tier controller holds targets behind, the
//! forward-branch fixup machinery, CPU feature detection, and executable
//! memory management.

pub mod arm64;
pub mod cpu;
pub mod fixup;
pub mod memory;
pub mod riscv;
pub mod x86_64;

use thiserror::Error;

use crate::ir::instr::{IrFunction, Op, Operand, Terminator, VReg};
use crate::regalloc::Allocation;

/// Target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    /// x86-64
    X86_64,
    /// ARM64 / AArch64
    Aarch64,
    /// RV64GC, optionally with V
    Riscv64,
}

impl TargetArch {
    /// The architecture this process runs on, if it is one we can emit for.
    pub fn host() -> Option<TargetArch> {
        if cfg!(target_arch = "x86_64") {
            Some(TargetArch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(TargetArch::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(TargetArch::Riscv64)
        } else {
            None
        }
    }
}

/// Code generation errors.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The tier's lowering does not cover this operation
    #[error("unsupported operation: {0}")]
    UnsupportedInstruction(String),
    /// A branch target exceeded the instruction's addressable range even in
    /// long form; the compile is rejected rather than miscompiled
    #[error("branch at {site} to {target} exceeds addressable range")]
    EncodingRangeExceeded {
        /// Branch site offset
        site: usize,
        /// Target offset
        target: usize,
    },
    /// A label was never bound
    #[error("unresolved label {0}")]
    UnresolvedLabel(u32),
    /// Executable memory could not be obtained
    #[error("executable memory: {0}")]
    Memory(String),
    /// The host platform has no executable-memory path
    #[error("unsupported platform for executable code")]
    UnsupportedPlatform,
}

/// A GC-visible pointer location at a safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSlot {
    /// A machine register (target encoding)
    Register(u8),
    /// Frame-pointer-relative offset
    Frame(i32),
}

/// Stack map: where live references are at one code offset.
#[derive(Debug, Clone)]
pub struct StackMapEntry {
    /// Native code offset
    pub native_offset: usize,
    /// Live reference locations
    pub slots: Vec<PointerSlot>,
}

/// One deoptimization point.
#[derive(Debug, Clone)]
pub struct DeoptEntry {
    /// Native code offset of the guard
    pub native_offset: usize,
    /// Bytecode offset to resume interpretation at
    pub bc: u32,
    /// Frame locations of the function's local slots, in slot order
    pub local_slots: Vec<PointerSlot>,
}

/// Safepoint site in generated code.
#[derive(Debug, Clone)]
pub struct SafepointEntry {
    /// Native code offset
    pub native_offset: usize,
    /// Bytecode offset it corresponds to
    pub bc: u32,
}

/// Output of a backend: raw bytes plus the artifact metadata the tier
/// controller installs alongside the entry pointer.
#[derive(Debug, Clone, Default)]
pub struct CodeBlob {
    /// Machine code
    pub code: Vec<u8>,
    /// Entry point offset inside `code`
    pub entry_offset: usize,
    /// OSR entries: bytecode offset → native offset
    pub osr_entries: Vec<(u32, usize)>,
    /// Safepoint sites
    pub safepoints: Vec<SafepointEntry>,
    /// Stack maps for the GC
    pub stack_maps: Vec<StackMapEntry>,
    /// Deoptimization table
    pub deopt_table: Vec<DeoptEntry>,
    /// native offset → bytecode offset map (debugging)
    pub ir_map: Vec<(usize, u32)>,
}

/// A pluggable code generator. The tier controller holds the selected target
/// behind this capability.
pub trait Backend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
    /// Architecture emitted for.
    fn arch(&self) -> TargetArch;
    /// Widest supported f64 vector width in lanes (1 = scalar only).
    fn vector_lanes(&self) -> u32;
    /// Registers the allocator may hand out (ABI-pinned and scratch
    /// registers excluded).
    fn allocatable(&self) -> Vec<crate::regalloc::PhysReg>;
    /// Emit one function.
    fn emit_function(&self, func: &IrFunction, alloc: &Allocation)
        -> Result<CodeBlob, CodegenError>;
}

/// Pick the backend for the host, if supported.
pub fn host_backend() -> Option<Box<dyn Backend>> {
    match TargetArch::host()? {
        TargetArch::X86_64 => Some(Box::new(x86_64::X64Backend::detect())),
        TargetArch::Aarch64 => Some(Box::new(arm64::Arm64Backend::detect())),
        TargetArch::Riscv64 => Some(Box::new(riscv::RiscvBackend::detect())),
    }
}

/// Replace phis with moves in predecessor blocks: standard SSA destruction
/// ahead of linear-scan allocation. Backends require phi-free input.
pub fn eliminate_phis(func: &mut IrFunction) {
    use crate::ir::instr::Instr;

    let mut pending: Vec<(crate::ir::instr::BlockId, Instr)> = Vec::new();
    for block in &mut func.blocks {
        let mut kept = Vec::with_capacity(block.instrs.len());
        for instr in block.instrs.drain(..) {
            if instr.op == Op::Phi {
                let dest = instr.dest;
                for pair in instr.args.chunks(2) {
                    if let (Some(Operand::Block(pred)), Some(src)) =
                        (pair.first().copied(), pair.get(1).copied())
                    {
                        pending.push((
                            pred,
                            Instr { op: Op::Move, dest, args: vec![src], bc: instr.bc },
                        ));
                    }
                }
            } else {
                kept.push(instr);
            }
        }
        block.instrs = kept;
    }
    for (pred, mv) in pending {
        func.block_mut(pred).instrs.push(mv);
    }
}

/// Successor blocks in emission (reverse postorder) with fallthrough first,
/// shared by the backends' block layout.
pub fn layout_order(func: &IrFunction) -> Vec<crate::ir::instr::BlockId> {
    crate::opt::analysis::reverse_postorder(func)
}

/// Speculative lowering of the generic operators the encoders do not carry:
/// numeric arithmetic and comparison compile as their double-typed forms
/// behind a guard, bitwise as the int32 forms. The guard's deopt entry is
/// what sends a non-number operand back to the interpreter. Operations with
/// no typed counterpart are left for the backend to reject (the compile then
/// falls back a tier).
pub fn lower_generic_ops(func: &mut IrFunction) {
    use crate::ir::instr::{BinOp, Const, Instr, Op};
    use crate::ir::types::JsType;

    for bi in 0..func.blocks.len() {
        let instrs = std::mem::take(&mut func.blocks[bi].instrs);
        let mut out: Vec<Instr> = Vec::with_capacity(instrs.len());
        for mut instr in instrs {
            let lowered = match instr.op {
                Op::Bin(b) => match b {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                        Some((Op::BinFloat(b), Op::GuardFloat))
                    }
                    BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
                    | BinOp::Ushr => Some((Op::BinInt(b), Op::GuardInt)),
                    BinOp::Mod => None,
                },
                Op::Cmp(c) => Some((Op::CmpFloat(c), Op::GuardFloat)),
                Op::Neg => Some((Op::NegFloat, Op::GuardFloat)),
                _ => None,
            };
            if let Some((op, guard)) = lowered {
                for r in instr.reg_uses().collect::<Vec<_>>() {
                    out.push(Instr {
                        op: guard,
                        dest: None,
                        args: vec![Operand::Reg(r)],
                        bc: instr.bc,
                    });
                }
                instr.op = op;
            }

            // Float-typed operations take double operands only: int
            // immediates widen in place, int32-typed registers go through an
            // explicit conversion so the encoders never move integer bit
            // patterns into a float unit.
            if matches!(
                instr.op,
                Op::BinFloat(_) | Op::CmpFloat(_) | Op::NegFloat | Op::Fma
            ) {
                for arg in &mut instr.args {
                    match *arg {
                        Operand::Imm(Const::I32(v)) => {
                            *arg = Operand::Imm(Const::F64(v as f64));
                        }
                        Operand::Imm(Const::Bool(b)) => {
                            *arg = Operand::Imm(Const::F64(b as i32 as f64));
                        }
                        Operand::Reg(r) if func.reg_types.get(&r) == Some(&JsType::Int32) => {
                            let widened = VReg(func.next_reg);
                            func.next_reg += 1;
                            func.reg_types.insert(widened, JsType::Float64);
                            out.push(Instr {
                                op: Op::Int32ToDouble,
                                dest: Some(widened),
                                args: vec![Operand::Reg(r)],
                                bc: instr.bc,
                            });
                            *arg = Operand::Reg(widened);
                        }
                        _ => {}
                    }
                }
            }
            out.push(instr);
        }
        func.blocks[bi].instrs = out;
    }
}

/// True when a terminator ends the function (no successors to lay out).
pub fn is_exit(term: &Terminator) -> bool {
    matches!(term, Terminator::Return(_) | Terminator::Throw(_) | Terminator::Deopt { .. })
}
