//! ARM64 backend
//!
//! A64 fixed-width encoders plus the branch planner: conditional branches
//! reach ±1 MiB, unconditional ±128 MiB. When a bound target is beyond the
//! conditional range the planner inverts the condition and hops over a
//! long-form unconditional branch. NEON (always present) provides the 2×f64
//! vector unit.
//!
//! Lowering follows the same load-op-store discipline as the x86-64 backend:
//! values live in their allocated homes, computation flows through the
//! reserved scratch registers x16/x17 and d0–d2, and vector temporaries are
//! block-local in v0–v7.

use rustc_hash::FxHashMap;

use crate::ir::instr::{
    BinOp, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use crate::regalloc::{Allocation, Location, PhysReg};

use super::cpu::{self, Arm64Features};
use super::fixup::{FixupSink, Label, PatchKind};
use super::{
    Backend, CodeBlob, CodegenError, DeoptEntry, PointerSlot, SafepointEntry, StackMapEntry,
    TargetArch,
};

/// Condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Equal
    Eq = 0x0,
    /// Not equal
    Ne = 0x1,
    /// Unsigned higher or same (carry set)
    Hs = 0x2,
    /// Unsigned lower (carry clear)
    Lo = 0x3,
    /// Negative
    Mi = 0x4,
    /// Positive or zero
    Pl = 0x5,
    /// Overflow
    Vs = 0x6,
    /// No overflow
    Vc = 0x7,
    /// Unsigned higher
    Hi = 0x8,
    /// Unsigned lower or same
    Ls = 0x9,
    /// Signed greater or equal
    Ge = 0xA,
    /// Signed less
    Lt = 0xB,
    /// Signed greater
    Gt = 0xC,
    /// Signed less or equal
    Le = 0xD,
    /// Always
    Al = 0xE,
}

impl Cond {
    /// The inverse condition (used by the long-form branch fallback).
    pub fn invert(self) -> Cond {
        match self {
            Cond::Al => Cond::Al,
            _ => {
                // Adjacent pairs differ in the low bit
                let v = self as u8 ^ 1;
                // Safety note not needed: every value 0..=0xD is a variant
                match v {
                    0x0 => Cond::Eq,
                    0x1 => Cond::Ne,
                    0x2 => Cond::Hs,
                    0x3 => Cond::Lo,
                    0x4 => Cond::Mi,
                    0x5 => Cond::Pl,
                    0x6 => Cond::Vs,
                    0x7 => Cond::Vc,
                    0x8 => Cond::Hi,
                    0x9 => Cond::Ls,
                    0xA => Cond::Ge,
                    0xB => Cond::Lt,
                    0xC => Cond::Gt,
                    _ => Cond::Le,
                }
            }
        }
    }
}

fn int_cond(op: CmpOp) -> Cond {
    match op {
        CmpOp::Eq | CmpOp::StrictEq => Cond::Eq,
        CmpOp::Ne | CmpOp::StrictNe => Cond::Ne,
        CmpOp::Lt => Cond::Lt,
        CmpOp::Le => Cond::Le,
        CmpOp::Gt => Cond::Gt,
        CmpOp::Ge => Cond::Ge,
    }
}

// After fcmp, the unsigned conditions give false on unordered inputs.
fn float_cond(op: CmpOp) -> Cond {
    match op {
        CmpOp::Eq | CmpOp::StrictEq => Cond::Eq,
        CmpOp::Ne | CmpOp::StrictNe => Cond::Ne,
        CmpOp::Lt => Cond::Lo,
        CmpOp::Le => Cond::Ls,
        CmpOp::Gt => Cond::Hi,
        CmpOp::Ge => Cond::Hs,
    }
}

const FP: u8 = 29;
const LR: u8 = 30;
const SP: u8 = 31;
const ZR: u8 = 31;
const SCRATCH0: u8 = 16;
const SCRATCH1: u8 = 17;

/// B ±128 MiB; B.cond / CBZ ±1 MiB.
pub enum A64Patch {
    /// Unconditional `b`
    B,
    /// Conditional `b.cond`
    BCond,
}

impl PatchKind for A64Patch {
    fn range(&self) -> i64 {
        match self {
            A64Patch::B => 128 * 1024 * 1024,
            A64Patch::BCond => 1024 * 1024,
        }
    }
    fn patch(&self, code: &mut [u8], site: usize, offset: i64) {
        let word = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
        let insn = match self {
            A64Patch::B => {
                let imm26 = ((offset / 4) as u32) & 0x03FF_FFFF;
                (word & 0xFC00_0000) | imm26
            }
            A64Patch::BCond => {
                let imm19 = ((offset / 4) as u32) & 0x7FFFF;
                (word & 0xFF00_001F) | (imm19 << 5)
            }
        };
        code[site..site + 4].copy_from_slice(&insn.to_le_bytes());
    }
}

/// A64 word emitter.
pub struct A64Asm {
    /// Emitted bytes (little endian words)
    pub code: Vec<u8>,
}

impl A64Asm {
    /// Empty buffer.
    pub fn new() -> Self {
        A64Asm { code: Vec::new() }
    }

    /// Current offset.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Append one instruction word.
    pub fn word(&mut self, w: u32) {
        self.code.extend_from_slice(&w.to_le_bytes());
    }

    /// movz xd, #imm16, lsl #(hw*16)
    pub fn movz(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.word(0xD280_0000 | ((hw as u32) << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// movk xd, #imm16, lsl #(hw*16)
    pub fn movk(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.word(0xF280_0000 | ((hw as u32) << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// Materialize an arbitrary 64-bit constant.
    pub fn mov_imm64(&mut self, rd: u8, v: u64) {
        self.movz(rd, (v & 0xFFFF) as u16, 0);
        for hw in 1..4 {
            let part = ((v >> (hw * 16)) & 0xFFFF) as u16;
            if part != 0 {
                self.movk(rd, part, hw as u8);
            }
        }
    }

    /// mov xd, xm (orr xd, xzr, xm)
    pub fn mov_rr(&mut self, rd: u8, rm: u8) {
        self.word(0xAA00_03E0 | ((rm as u32) << 16) | rd as u32);
    }

    /// add xd, xn, xm
    pub fn add(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x8B00_0000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// add xd, xn, xm, lsl #shift
    pub fn add_shifted(&mut self, rd: u8, rn: u8, rm: u8, shift: u8) {
        self.word(
            0x8B00_0000
                | ((rm as u32) << 16)
                | ((shift as u32) << 10)
                | ((rn as u32) << 5)
                | rd as u32,
        );
    }

    /// sub xd, xn, xm
    pub fn sub(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0xCB00_0000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// mul xd, xn, xm (madd with xzr)
    pub fn mul(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x9B00_7C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// and/orr/eor xd, xn, xm — base is the opcode word
    pub fn logic(&mut self, base: u32, rd: u8, rn: u8, rm: u8) {
        self.word(base | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// lslv/asrv/lsrv xd, xn, xm
    pub fn shift_var(&mut self, op2: u32, rd: u8, rn: u8, rm: u8) {
        self.word(0x9AC0_2000 | op2 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// cmp xn, xm (subs xzr, xn, xm)
    pub fn cmp(&mut self, rn: u8, rm: u8) {
        self.word(0xEB00_0000 | ((rm as u32) << 16) | ((rn as u32) << 5) | ZR as u32);
    }

    /// cmp xn, #imm12
    pub fn cmp_imm(&mut self, rn: u8, imm12: u16) {
        self.word(0xF100_0000 | ((imm12 as u32) << 10) | ((rn as u32) << 5) | ZR as u32);
    }

    /// cset xd, cond
    pub fn cset(&mut self, rd: u8, cond: Cond) {
        self.word(0x9A9F_07E0 | ((cond.invert() as u32) << 12) | rd as u32);
    }

    /// csel xd, xn, xm, cond
    pub fn csel(&mut self, rd: u8, rn: u8, rm: u8, cond: Cond) {
        self.word(
            0x9A80_0000
                | ((rm as u32) << 16)
                | ((cond as u32) << 12)
                | ((rn as u32) << 5)
                | rd as u32,
        );
    }

    /// neg xd, xm (sub xd, xzr, xm)
    pub fn neg(&mut self, rd: u8, rm: u8) {
        self.word(0xCB00_0000 | ((rm as u32) << 16) | ((ZR as u32) << 5) | rd as u32);
    }

    /// mvn xd, xm (orn xd, xzr, xm)
    pub fn mvn(&mut self, rd: u8, rm: u8) {
        self.word(0xAA20_03E0 | ((rm as u32) << 16) | rd as u32);
    }

    /// sxtw xd, xn (sign-extend low 32 bits)
    pub fn sxtw(&mut self, rd: u8, rn: u8) {
        self.word(0x9340_7C00 | ((rn as u32) << 5) | rd as u32);
    }

    /// ldur xt, [xn, #imm9] — signed 9-bit offset
    pub fn ldur(&mut self, rt: u8, rn: u8, imm9: i32) {
        let imm = (imm9 as u32) & 0x1FF;
        self.word(0xF840_0000 | (imm << 12) | ((rn as u32) << 5) | rt as u32);
    }

    /// stur xt, [xn, #imm9]
    pub fn stur(&mut self, rt: u8, rn: u8, imm9: i32) {
        let imm = (imm9 as u32) & 0x1FF;
        self.word(0xF800_0000 | (imm << 12) | ((rn as u32) << 5) | rt as u32);
    }

    /// ldr xt, [xn, xm]
    pub fn ldr_reg(&mut self, rt: u8, rn: u8, rm: u8) {
        self.word(0xF860_6800 | ((rm as u32) << 16) | ((rn as u32) << 5) | rt as u32);
    }

    /// str xt, [xn, xm]
    pub fn str_reg(&mut self, rt: u8, rn: u8, rm: u8) {
        self.word(0xF820_6800 | ((rm as u32) << 16) | ((rn as u32) << 5) | rt as u32);
    }

    /// stp x29, x30, [sp, #-16]!
    pub fn push_frame(&mut self) {
        self.word(0xA9BF_7BFD);
    }

    /// ldp x29, x30, [sp], #16
    pub fn pop_frame(&mut self) {
        self.word(0xA8C1_7BFD);
    }

    /// mov x29, sp
    pub fn mov_fp_sp(&mut self) {
        self.word(0x9100_03FD);
    }

    /// sub sp, sp, #imm12
    pub fn sub_sp(&mut self, imm12: u16) {
        self.word(0xD100_0000 | ((imm12 as u32) << 10) | ((SP as u32) << 5) | SP as u32);
    }

    /// add sp, sp, #imm12
    pub fn add_sp(&mut self, imm12: u16) {
        self.word(0x9100_0000 | ((imm12 as u32) << 10) | ((SP as u32) << 5) | SP as u32);
    }

    /// ret
    pub fn ret(&mut self) {
        self.word(0xD65F_03C0);
    }

    /// brk #0 (trap)
    pub fn brk(&mut self) {
        self.word(0xD420_0000);
    }

    /// b with zeroed imm26; returns site
    pub fn b_site(&mut self) -> usize {
        let site = self.pos();
        self.word(0x1400_0000);
        site
    }

    /// b.cond with zeroed imm19; returns site
    pub fn bcond_site(&mut self, cond: Cond) -> usize {
        let site = self.pos();
        self.word(0x5400_0000 | cond as u32);
        site
    }

    /// cbz/cbnz xt with zeroed imm19; returns site
    pub fn cbz_site(&mut self, rt: u8, nonzero: bool) -> usize {
        let site = self.pos();
        let base = if nonzero { 0xB500_0000 } else { 0xB400_0000 };
        self.word(base | rt as u32);
        site
    }

    // ===== Scalar floating point (double) =====

    /// fmov dd, xn
    pub fn fmov_dx(&mut self, rd: u8, rn: u8) {
        self.word(0x9E67_0000 | ((rn as u32) << 5) | rd as u32);
    }

    /// fmov xd, dn
    pub fn fmov_xd(&mut self, rd: u8, rn: u8) {
        self.word(0x9E66_0000 | ((rn as u32) << 5) | rd as u32);
    }

    /// fadd/fsub/fmul/fdiv dd, dn, dm — op selects the family
    pub fn fbin(&mut self, op: FBin, rd: u8, rn: u8, rm: u8) {
        let base = match op {
            FBin::Add => 0x1E60_2800,
            FBin::Sub => 0x1E60_3800,
            FBin::Mul => 0x1E60_0800,
            FBin::Div => 0x1E60_1800,
        };
        self.word(base | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// fmadd dd, dn, dm, da: dd = da + dn*dm
    pub fn fmadd(&mut self, rd: u8, rn: u8, rm: u8, ra: u8) {
        self.word(
            0x1F40_0000
                | ((rm as u32) << 16)
                | ((ra as u32) << 10)
                | ((rn as u32) << 5)
                | rd as u32,
        );
    }

    /// fcmp dn, dm
    pub fn fcmp(&mut self, rn: u8, rm: u8) {
        self.word(0x1E60_2000 | ((rm as u32) << 16) | ((rn as u32) << 5));
    }

    /// scvtf dd, xn
    pub fn scvtf(&mut self, rd: u8, rn: u8) {
        self.word(0x9E62_0000 | ((rn as u32) << 5) | rd as u32);
    }

    /// fcvtzs xd, dn
    pub fn fcvtzs(&mut self, rd: u8, rn: u8) {
        self.word(0x9E78_0000 | ((rn as u32) << 5) | rd as u32);
    }

    /// fneg dd, dn
    pub fn fneg(&mut self, rd: u8, rn: u8) {
        self.word(0x1E61_4000 | ((rn as u32) << 5) | rd as u32);
    }

    // ===== NEON (2 × f64) =====

    /// ld1 {vt.2d}, [xn]
    pub fn ld1_2d(&mut self, vt: u8, rn: u8) {
        self.word(0x4C40_7800 | ((rn as u32) << 5) | vt as u32);
    }

    /// st1 {vt.2d}, [xn]
    pub fn st1_2d(&mut self, vt: u8, rn: u8) {
        self.word(0x4C00_7800 | ((rn as u32) << 5) | vt as u32);
    }

    /// fadd vd.2d, vn.2d, vm.2d
    pub fn vfadd_2d(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4E60_D400 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// fsub vd.2d
    pub fn vfsub_2d(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4EE0_D400 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// fmul vd.2d
    pub fn vfmul_2d(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x6E60_DC00 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// fmla vd.2d, vn.2d, vm.2d (vd += vn*vm)
    pub fn vfmla_2d(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4E60_CC00 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }
}

impl Default for A64Asm {
    fn default() -> Self {
        Self::new()
    }
}

/// Float op selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FBin {
    /// fadd
    Add,
    /// fsub
    Sub,
    /// fmul
    Mul,
    /// fdiv
    Div,
}

/// The ARM64 backend.
pub struct Arm64Backend {
    #[allow(dead_code)]
    features: Arm64Features,
}

impl Arm64Backend {
    /// Backend with host-detected features.
    pub fn detect() -> Self {
        Arm64Backend { features: cpu::features().arm64 }
    }

    /// Backend with an explicit feature set.
    pub fn with_features(features: Arm64Features) -> Self {
        Arm64Backend { features }
    }

    /// Emit a conditional branch to a bound offset, falling back to the
    /// inverted-condition long form when ±1 MiB is exceeded. Used directly by
    /// the emitter when the target is already known; label-based branches go
    /// through the fixup sink.
    pub fn emit_bcond_to(&self, asm: &mut A64Asm, cond: Cond, target: usize) {
        let offset = target as i64 - asm.pos() as i64;
        if (-(1 << 20)..(1 << 20)).contains(&offset) {
            let site = asm.bcond_site(cond);
            A64Patch::BCond.patch(&mut asm.code, site, offset);
        } else {
            // Inverted condition hops over a long-form unconditional branch
            let skip = asm.bcond_site(cond.invert());
            A64Patch::BCond.patch(&mut asm.code, skip, 8);
            let site = asm.b_site();
            let offset = target as i64 - site as i64;
            A64Patch::B.patch(&mut asm.code, site, offset);
        }
    }
}

struct Frame {
    spill_area: i32,
    locals_area: i32,
    frame_size: i32,
}

impl Frame {
    fn new(func: &IrFunction, alloc: &Allocation) -> Self {
        let spill_area = alloc.spill_area_size() as i32;
        let locals_area = (func.local_count as i32) * 8;
        let args_area = (func.param_count as i32) * 8;
        let raw = spill_area + locals_area + args_area;
        Frame { spill_area, locals_area, frame_size: (raw + 15) & !15 }
    }
    fn spill(&self, slot: u32) -> i32 {
        -8 * (slot as i32 + 1)
    }
    fn local(&self, slot: i32) -> i32 {
        -(self.spill_area + 8 * (slot + 1))
    }
    fn arg(&self, index: i32) -> i32 {
        -(self.spill_area + self.locals_area + 8 * (index + 1))
    }
}

impl Backend for Arm64Backend {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn arch(&self) -> TargetArch {
        TargetArch::Aarch64
    }

    fn vector_lanes(&self) -> u32 {
        2 // NEON 128-bit, 2 × f64
    }

    fn allocatable(&self) -> Vec<PhysReg> {
        // x0-x15 minus the x16/x17 scratch pair; x18 is platform-reserved,
        // x19+ callee-saved, x29/x30/sp pinned
        (0u8..16).map(PhysReg).collect()
    }

    fn emit_function(
        &self,
        func: &IrFunction,
        alloc: &Allocation,
    ) -> Result<CodeBlob, CodegenError> {
        let mut asm = A64Asm::new();
        let mut fixups: FixupSink<A64Patch> = FixupSink::new();
        let frame = Frame::new(func, alloc);
        let mut blob = CodeBlob::default();

        asm.push_frame();
        asm.mov_fp_sp();
        if frame.frame_size > 0 {
            asm.sub_sp(frame.frame_size as u16);
        }
        for i in 0..func.param_count.min(8) {
            self.store_frame(&mut asm, frame.arg(i as i32), i as u8);
        }

        let local_slots: Vec<PointerSlot> = (0..func.local_count as i32)
            .map(|i| PointerSlot::Frame(frame.local(i)))
            .collect();

        let order = super::layout_order(func);
        let labels: FxHashMap<_, Label> = order.iter().map(|&b| (b, fixups.fresh())).collect();

        for (pos, &bid) in order.iter().enumerate() {
            let offset = asm.pos();
            fixups.bind(&mut asm.code, labels[&bid], offset)?;
            if func.loop_headers.contains(&func.block(bid).bc_start) {
                blob.osr_entries.push((func.block(bid).bc_start, asm.pos()));
            }

            let mut vec_homes: FxHashMap<VReg, u8> = FxHashMap::default();
            let mut next_vec: u8 = 0;

            for instr in &func.block(bid).instrs {
                blob.ir_map.push((asm.pos(), instr.bc));
                self.emit_instr(
                    &mut asm,
                    instr,
                    alloc,
                    &frame,
                    &local_slots,
                    &mut blob,
                    &mut vec_homes,
                    &mut next_vec,
                )?;
            }

            let next = order.get(pos + 1).copied();
            match &func.block(bid).term {
                Terminator::Jump(t) => {
                    if next != Some(*t) {
                        let site = asm.b_site();
                        fixups.use_label(&mut asm.code, site, labels[t], A64Patch::B)?;
                    }
                }
                Terminator::Branch { cond, then_block, else_block } => {
                    self.load_operand(&mut asm, cond, SCRATCH0, alloc, &frame)?;
                    // cbnz keeps the compare-to-zero fused
                    let site = asm.cbz_site(SCRATCH0, true);
                    fixups.use_label(&mut asm.code, site, labels[then_block], A64Patch::BCond)?;
                    if next != Some(*else_block) {
                        let site = asm.b_site();
                        fixups.use_label(&mut asm.code, site, labels[else_block], A64Patch::B)?;
                    }
                }
                Terminator::Return(v) => {
                    match v {
                        Some(v) => self.load_operand(&mut asm, v, 0, alloc, &frame)?,
                        None => asm.movz(0, 0, 0),
                    }
                    if frame.frame_size > 0 {
                        asm.add_sp(frame.frame_size as u16);
                    }
                    asm.pop_frame();
                    asm.ret();
                }
                Terminator::Throw(_) | Terminator::Deopt { .. } => {
                    if let Terminator::Deopt { bc, .. } = &func.block(bid).term {
                        blob.deopt_table.push(DeoptEntry {
                            native_offset: asm.pos(),
                            bc: *bc,
                            local_slots: local_slots.clone(),
                        });
                    }
                    asm.brk();
                }
                Terminator::None => {
                    return Err(CodegenError::UnsupportedInstruction("open block".to_string()))
                }
            }
        }

        fixups.finish()?;
        blob.code = asm.code;
        Ok(blob)
    }
}

impl Arm64Backend {
    fn load_frame(&self, asm: &mut A64Asm, dst: u8, off: i32) {
        if (-256..256).contains(&off) {
            asm.ldur(dst, FP, off);
        } else {
            asm.mov_imm64(SCRATCH1, off as i64 as u64);
            asm.ldr_reg(dst, FP, SCRATCH1);
        }
    }

    fn store_frame(&self, asm: &mut A64Asm, off: i32, src: u8) {
        if (-256..256).contains(&off) {
            asm.stur(src, FP, off);
        } else {
            asm.mov_imm64(SCRATCH1, off as i64 as u64);
            asm.str_reg(src, FP, SCRATCH1);
        }
    }

    fn load_operand(
        &self,
        asm: &mut A64Asm,
        op: &Operand,
        dst: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match op {
            Operand::Imm(c) => {
                match c {
                    Const::I32(v) => asm.mov_imm64(dst, *v as i64 as u64),
                    Const::Bool(b) => asm.movz(dst, *b as u16, 0),
                    Const::Null | Const::Undefined => asm.movz(dst, 0, 0),
                    Const::F64(v) => asm.mov_imm64(dst, v.to_bits()),
                    Const::Str(_) => {
                        return Err(CodegenError::UnsupportedInstruction(
                            "string immediate".to_string(),
                        ))
                    }
                }
                Ok(())
            }
            Operand::Reg(r) => {
                match alloc.location(*r) {
                    Some(Location::Reg(PhysReg(src))) => {
                        if src != dst {
                            asm.mov_rr(dst, src);
                        }
                    }
                    Some(Location::Spill(s)) => self.load_frame(asm, dst, frame.spill(s)),
                    None => {
                        return Err(CodegenError::UnsupportedInstruction(format!(
                            "unallocated {}",
                            r
                        )))
                    }
                }
                Ok(())
            }
            Operand::Block(_) => {
                Err(CodegenError::UnsupportedInstruction("block operand".to_string()))
            }
        }
    }

    fn store_dest(
        &self,
        asm: &mut A64Asm,
        dest: VReg,
        src: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match alloc.location(dest) {
            Some(Location::Reg(PhysReg(d))) => {
                if d != src {
                    asm.mov_rr(d, src);
                }
                Ok(())
            }
            Some(Location::Spill(s)) => {
                self.store_frame(asm, frame.spill(s), src);
                Ok(())
            }
            None => Err(CodegenError::UnsupportedInstruction(format!("unallocated {}", dest))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instr(
        &self,
        asm: &mut A64Asm,
        instr: &Instr,
        alloc: &Allocation,
        frame: &Frame,
        local_slots: &[PointerSlot],
        blob: &mut CodeBlob,
        vec_homes: &mut FxHashMap<VReg, u8>,
        next_vec: &mut u8,
    ) -> Result<(), CodegenError> {
        let unsupported =
            |what: &str| CodegenError::UnsupportedInstruction(what.to_string());
        let dest = instr.dest;
        match instr.op {
            Op::Const | Op::Move => {
                let d = dest.ok_or_else(|| unsupported("value without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::BinInt(b) => {
                let d = dest.ok_or_else(|| unsupported("bin without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                match b {
                    BinOp::Add => asm.add(SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Sub => asm.sub(SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Mul => asm.mul(SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::BitAnd => asm.logic(0x8A00_0000, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::BitOr => asm.logic(0xAA00_0000, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::BitXor => asm.logic(0xCA00_0000, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Shl => asm.shift_var(0x0000, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Shr => asm.shift_var(0x0800, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Ushr => asm.shift_var(0x0400, SCRATCH0, SCRATCH0, SCRATCH1),
                    BinOp::Div | BinOp::Mod => {
                        return Err(unsupported("int division lowers through the runtime"))
                    }
                }
                asm.sxtw(SCRATCH0, SCRATCH0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::NegInt => {
                let d = dest.ok_or_else(|| unsupported("neg without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.neg(SCRATCH0, SCRATCH0);
                asm.sxtw(SCRATCH0, SCRATCH0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::BitNot => {
                let d = dest.ok_or_else(|| unsupported("bitnot without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.mvn(SCRATCH0, SCRATCH0);
                asm.sxtw(SCRATCH0, SCRATCH0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::Not => {
                let d = dest.ok_or_else(|| unsupported("not without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.cmp_imm(SCRATCH0, 0);
                asm.cset(SCRATCH0, Cond::Eq);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::CmpInt(c) => {
                let d = dest.ok_or_else(|| unsupported("cmp without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                asm.cmp(SCRATCH0, SCRATCH1);
                asm.cset(SCRATCH0, int_cond(c));
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::BinFloat(b) => {
                let d = dest.ok_or_else(|| unsupported("fbin without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                asm.fmov_dx(0, SCRATCH0);
                asm.fmov_dx(1, SCRATCH1);
                let op = match b {
                    BinOp::Add => FBin::Add,
                    BinOp::Sub => FBin::Sub,
                    BinOp::Mul => FBin::Mul,
                    BinOp::Div => FBin::Div,
                    _ => return Err(unsupported("float bitwise")),
                };
                asm.fbin(op, 0, 0, 1);
                asm.fmov_xd(SCRATCH0, 0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::NegFloat => {
                let d = dest.ok_or_else(|| unsupported("fneg without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.fmov_dx(0, SCRATCH0);
                asm.fneg(0, 0);
                asm.fmov_xd(SCRATCH0, 0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::Fma => {
                let d = dest.ok_or_else(|| unsupported("fma without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.fmov_dx(0, SCRATCH0);
                self.load_operand(asm, &instr.args[1], SCRATCH0, alloc, frame)?;
                asm.fmov_dx(1, SCRATCH0);
                self.load_operand(asm, &instr.args[2], SCRATCH0, alloc, frame)?;
                asm.fmov_dx(2, SCRATCH0);
                asm.fmadd(0, 0, 1, 2);
                asm.fmov_xd(SCRATCH0, 0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::CmpFloat(c) => {
                let d = dest.ok_or_else(|| unsupported("fcmp without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                asm.fmov_dx(0, SCRATCH0);
                asm.fmov_dx(1, SCRATCH1);
                asm.fcmp(0, 1);
                asm.cset(SCRATCH0, float_cond(c));
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::Int32ToDouble => {
                let d = dest.ok_or_else(|| unsupported("i2d without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.scvtf(0, SCRATCH0);
                asm.fmov_xd(SCRATCH0, 0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::DoubleToInt32 => {
                let d = dest.ok_or_else(|| unsupported("d2i without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                asm.fmov_dx(0, SCRATCH0);
                asm.fcvtzs(SCRATCH0, 0);
                asm.sxtw(SCRATCH0, SCRATCH0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::LoadLocal | Op::LoadArg => {
                let d = dest.ok_or_else(|| unsupported("load without dest"))?;
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::LoadLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                self.load_frame(asm, SCRATCH0, off);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::StoreLocal | Op::StoreArg => {
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::StoreLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                self.load_operand(asm, &instr.args[1], SCRATCH0, alloc, frame)?;
                self.store_frame(asm, off, SCRATCH0);
            }
            Op::GuardInt | Op::GuardFloat | Op::GuardString => {
                blob.deopt_table.push(DeoptEntry {
                    native_offset: asm.pos(),
                    bc: instr.bc,
                    local_slots: local_slots.to_vec(),
                });
            }
            Op::Safepoint => {
                blob.safepoints.push(SafepointEntry { native_offset: asm.pos(), bc: instr.bc });
                blob.stack_maps.push(StackMapEntry {
                    native_offset: asm.pos(),
                    slots: local_slots.to_vec(),
                });
            }
            Op::VecWidth => {
                let d = dest.ok_or_else(|| unsupported("vwidth without dest"))?;
                asm.movz(SCRATCH0, self.vector_lanes() as u16, 0);
                self.store_dest(asm, d, SCRATCH0, alloc, frame)?;
            }
            Op::VecLoad => {
                let d = dest.ok_or_else(|| unsupported("vload without dest"))?;
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                asm.add_shifted(SCRATCH0, SCRATCH0, SCRATCH1, 3);
                let v = alloc_vec(vec_homes, next_vec, d)?;
                asm.ld1_2d(v, SCRATCH0);
            }
            Op::VecStore => {
                self.load_operand(asm, &instr.args[0], SCRATCH0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], SCRATCH1, alloc, frame)?;
                asm.add_shifted(SCRATCH0, SCRATCH0, SCRATCH1, 3);
                let v = lookup_vec(
                    vec_homes,
                    instr.args.get(2).and_then(|a| a.as_reg()),
                )?;
                asm.st1_2d(v, SCRATCH0);
            }
            Op::VecBin(b) => {
                let d = dest.ok_or_else(|| unsupported("vbin without dest"))?;
                let vn = lookup_vec(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let vm = lookup_vec(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let vd = alloc_vec(vec_homes, next_vec, d)?;
                match b {
                    BinOp::Add => asm.vfadd_2d(vd, vn, vm),
                    BinOp::Sub => asm.vfsub_2d(vd, vn, vm),
                    BinOp::Mul => asm.vfmul_2d(vd, vn, vm),
                    _ => return Err(unsupported("vector op")),
                }
            }
            Op::VecFma => {
                let d = dest.ok_or_else(|| unsupported("vfma without dest"))?;
                let va = lookup_vec(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let vb = lookup_vec(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let vc = lookup_vec(vec_homes, instr.args.get(2).and_then(|a| a.as_reg()))?;
                let vd = alloc_vec(vec_homes, next_vec, d)?;
                // Accumulate into a copy of the addend
                asm.word(0x4EA0_1C00 | ((vc as u32) << 16) | ((vc as u32) << 5) | vd as u32); // mov vd, vc
                asm.vfmla_2d(vd, va, vb);
            }
            _ => return Err(CodegenError::UnsupportedInstruction(format!("{:?}", instr.op))),
        }
        Ok(())
    }
}

fn alloc_vec(
    homes: &mut FxHashMap<VReg, u8>,
    next: &mut u8,
    reg: VReg,
) -> Result<u8, CodegenError> {
    if *next >= 8 {
        return Err(CodegenError::UnsupportedInstruction(
            "vector register pressure".to_string(),
        ));
    }
    let v = *next;
    *next += 1;
    homes.insert(reg, v);
    Ok(v)
}

fn lookup_vec(homes: &FxHashMap<VReg, u8>, reg: Option<VReg>) -> Result<u8, CodegenError> {
    reg.and_then(|r| homes.get(&r).copied())
        .ok_or_else(|| CodegenError::UnsupportedInstruction("vector operand escaped".to_string()))
}

fn imm_i32(op: &Operand) -> Result<i32, CodegenError> {
    match op {
        Operand::Imm(Const::I32(v)) => Ok(*v),
        _ => Err(CodegenError::UnsupportedInstruction("expected immediate".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::JsType;
    use crate::regalloc;

    #[test]
    fn test_cond_inversion() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
        assert_eq!(Cond::Hi.invert(), Cond::Ls);
        assert_eq!(Cond::Al.invert(), Cond::Al);
    }

    #[test]
    fn test_movz_encoding() {
        let mut a = A64Asm::new();
        a.movz(0, 42, 0); // movz x0, #42
        let w = u32::from_le_bytes(a.code[0..4].try_into().unwrap());
        assert_eq!(w, 0xD280_0540);
    }

    #[test]
    fn test_add_encoding() {
        let mut a = A64Asm::new();
        a.add(0, 1, 2); // add x0, x1, x2
        let w = u32::from_le_bytes(a.code[0..4].try_into().unwrap());
        assert_eq!(w, 0x8B02_0020);
    }

    #[test]
    fn test_b_patching() {
        let mut a = A64Asm::new();
        let site = a.b_site();
        a.movz(0, 0, 0);
        A64Patch::B.patch(&mut a.code, site, 8);
        let w = u32::from_le_bytes(a.code[0..4].try_into().unwrap());
        assert_eq!(w, 0x1400_0002); // imm26 = 2 instructions
    }

    #[test]
    fn test_bcond_in_range() {
        let backend = Arm64Backend::with_features(Arm64Features::default());
        let mut a = A64Asm::new();
        a.movz(0, 0, 0); // target at 0
        a.movz(1, 0, 0);
        backend.emit_bcond_to(&mut a, Cond::Eq, 0);
        // One b.cond word, negative offset
        assert_eq!(a.code.len(), 12);
        let w = u32::from_le_bytes(a.code[8..12].try_into().unwrap());
        assert_eq!(w & 0xFF00_0000, 0x5400_0000);
        assert_eq!(w & 0xF, Cond::Eq as u32);
    }

    #[test]
    fn test_bcond_out_of_range_uses_long_form() {
        let backend = Arm64Backend::with_features(Arm64Features::default());
        let mut a = A64Asm::new();
        // Pretend the branch sits 2 MiB into the function, targeting 0
        a.code = vec![0; 2 * 1024 * 1024];
        let start = a.pos();
        backend.emit_bcond_to(&mut a, Cond::Eq, 0);
        // Two words: inverted b.cond skipping the long b
        assert_eq!(a.pos() - start, 8);
        let w1 = u32::from_le_bytes(a.code[start..start + 4].try_into().unwrap());
        let w2 = u32::from_le_bytes(a.code[start + 4..start + 8].try_into().unwrap());
        assert_eq!(w1 & 0xFF00_0000, 0x5400_0000);
        assert_eq!(w1 & 0xF, Cond::Ne as u32); // inverted
        assert_eq!(w1 >> 5 & 0x7FFFF, 2); // skips one instruction
        assert_eq!(w2 & 0xFC00_0000, 0x1400_0000); // long-form b
    }

    #[test]
    fn test_emit_scalar_function() {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 2, 0);
        let b = f.add_block(0);
        let x = f.alloc_reg(JsType::Int32);
        let y = f.alloc_reg(JsType::Int32);
        let s = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::LoadArg, dest: Some(x), args: vec![Operand::Imm(Const::I32(0))], bc: 0 },
            Instr { op: Op::LoadArg, dest: Some(y), args: vec![Operand::Imm(Const::I32(1))], bc: 1 },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(s),
                args: vec![Operand::Reg(x), Operand::Reg(y)],
                bc: 2,
            },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(s)));

        let backend = Arm64Backend::with_features(Arm64Features { neon: true, ..Default::default() });
        let alloc = regalloc::allocate(&f, &backend.allocatable());
        let blob = backend.emit_function(&f, &alloc).unwrap();

        // Word-aligned, starts with stp x29,x30 and ends with ret
        assert_eq!(blob.code.len() % 4, 0);
        let first = u32::from_le_bytes(blob.code[0..4].try_into().unwrap());
        assert_eq!(first, 0xA9BF_7BFD);
        let n = blob.code.len();
        let last = u32::from_le_bytes(blob.code[n - 4..].try_into().unwrap());
        assert_eq!(last, 0xD65F_03C0);
    }

    #[test]
    fn test_vector_body_uses_neon() {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 3, 0);
        let b = f.add_block(0);
        let a0 = f.alloc_reg(JsType::Array);
        let a1 = f.alloc_reg(JsType::Array);
        let i = f.alloc_reg(JsType::Int32);
        let v0 = f.alloc_reg(JsType::Float64);
        let v1 = f.alloc_reg(JsType::Float64);
        let v2 = f.alloc_reg(JsType::Float64);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::LoadArg, dest: Some(a0), args: vec![Operand::Imm(Const::I32(0))], bc: 0 },
            Instr { op: Op::LoadArg, dest: Some(a1), args: vec![Operand::Imm(Const::I32(1))], bc: 1 },
            Instr { op: Op::Const, dest: Some(i), args: vec![Operand::Imm(Const::I32(0))], bc: 2 },
            Instr {
                op: Op::VecLoad,
                dest: Some(v0),
                args: vec![Operand::Reg(a0), Operand::Reg(i)],
                bc: 3,
            },
            Instr {
                op: Op::VecLoad,
                dest: Some(v1),
                args: vec![Operand::Reg(a1), Operand::Reg(i)],
                bc: 4,
            },
            Instr {
                op: Op::VecBin(BinOp::Mul),
                dest: Some(v2),
                args: vec![Operand::Reg(v0), Operand::Reg(v1)],
                bc: 5,
            },
            Instr {
                op: Op::VecStore,
                dest: None,
                args: vec![Operand::Reg(a0), Operand::Reg(i), Operand::Reg(v2)],
                bc: 6,
            },
        ];
        f.block_mut(b).term = Terminator::Return(None);

        let backend = Arm64Backend::with_features(Arm64Features { neon: true, ..Default::default() });
        let alloc = regalloc::allocate(&f, &backend.allocatable());
        let blob = backend.emit_function(&f, &alloc).unwrap();

        let words: Vec<u32> = blob
            .code
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // ld1 {v.2d} appears twice, fmul.2d once, st1 once
        assert_eq!(words.iter().filter(|&&w| w & 0xFFFF_FC00 == 0x4C40_7800).count(), 2);
        assert!(words.iter().any(|&w| w & 0xFFE0_FC00 == 0x6E60_DC00));
        assert_eq!(words.iter().filter(|&&w| w & 0xFFFF_FC00 == 0x4C00_7800).count(), 1);
    }
}
