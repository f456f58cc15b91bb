//! x86-64 backend
//!
//! Direct bit-level encoders (REX / ModRM / SIB) with no hidden state, a
//! load-op-store lowering that keeps every value in its allocated home
//! (register or frame slot) and computes through the reserved scratch
//! registers r10/r11 and xmm0–xmm2, and feature-gated form selection:
//! SSE2 is the floor, FMA fuses multiply-add when present.
//!
//! Frame layout (rbp-relative, growing down): spill slots, then locals,
//! then incoming arguments copied out of their ABI registers.

use crate::ir::instr::{
    BinOp, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use crate::regalloc::{Allocation, Location, PhysReg};

use super::cpu::{self, X64Features};
use super::fixup::{FixupSink, Label, PatchKind};
use super::{
    Backend, CodeBlob, CodegenError, DeoptEntry, PointerSlot, SafepointEntry, StackMapEntry,
    TargetArch,
};

// Register numbers (hardware encoding)
pub(crate) const RAX: u8 = 0;
pub(crate) const RCX: u8 = 1;
pub(crate) const RDX: u8 = 2;
pub(crate) const RSP: u8 = 4;
pub(crate) const RBP: u8 = 5;
pub(crate) const RSI: u8 = 6;
pub(crate) const RDI: u8 = 7;
pub(crate) const R8: u8 = 8;
pub(crate) const R9: u8 = 9;
pub(crate) const R10: u8 = 10;
pub(crate) const R11: u8 = 11;

/// System V argument registers, in order.
const ARG_REGS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Branch patch kinds.
pub enum X64Patch {
    /// `jmp rel32` (opcode E9, disp at site+1, relative to site+5)
    Jmp,
    /// `jcc rel32` (0F 8x, disp at site+2, relative to site+6)
    Jcc,
}

impl PatchKind for X64Patch {
    fn range(&self) -> i64 {
        i32::MAX as i64
    }
    fn patch(&self, code: &mut [u8], site: usize, offset: i64) {
        match self {
            X64Patch::Jmp => {
                let disp = (offset - 5) as i32;
                code[site + 1..site + 5].copy_from_slice(&disp.to_le_bytes());
            }
            X64Patch::Jcc => {
                let disp = (offset - 6) as i32;
                code[site + 2..site + 6].copy_from_slice(&disp.to_le_bytes());
            }
        }
    }
}

/// Condition codes (the `cc` nibble of 0F 8x / 0F 9x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cc {
    /// ZF=1
    E = 0x4,
    /// ZF=0
    Ne = 0x5,
    /// SF≠OF
    L = 0xC,
    /// ZF=1 or SF≠OF
    Le = 0xE,
    /// ZF=0 and SF=OF
    G = 0xF,
    /// SF=OF
    Ge = 0xD,
    /// CF=1 (unsigned below; used after ucomisd)
    B = 0x2,
    /// CF=1 or ZF=1
    Be = 0x6,
    /// CF=0 and ZF=0
    A = 0x7,
    /// CF=0
    Ae = 0x3,
}

fn int_cc(op: CmpOp) -> Cc {
    match op {
        CmpOp::Eq | CmpOp::StrictEq => Cc::E,
        CmpOp::Ne | CmpOp::StrictNe => Cc::Ne,
        CmpOp::Lt => Cc::L,
        CmpOp::Le => Cc::Le,
        CmpOp::Gt => Cc::G,
        CmpOp::Ge => Cc::Ge,
    }
}

// After ucomisd, unordered sets CF/ZF/PF; the unsigned-above forms give the
// JS false-on-NaN behavior for <, <=, >, >= when operands are ordered
// left-to-right.
fn float_cc(op: CmpOp) -> Cc {
    match op {
        CmpOp::Eq | CmpOp::StrictEq => Cc::E,
        CmpOp::Ne | CmpOp::StrictNe => Cc::Ne,
        CmpOp::Lt => Cc::B,
        CmpOp::Le => Cc::Be,
        CmpOp::Gt => Cc::A,
        CmpOp::Ge => Cc::Ae,
    }
}

/// Pure byte emitter over a code buffer.
pub struct Asm {
    /// The bytes
    pub code: Vec<u8>,
}

impl Asm {
    /// Empty buffer.
    pub fn new() -> Self {
        Asm { code: Vec::new() }
    }

    /// Current offset.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    fn u8(&mut self, b: u8) {
        self.code.push(b);
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let mut b = 0x40;
        if w {
            b |= 0x08;
        }
        if reg >= 8 {
            b |= 0x04;
        }
        if rm >= 8 {
            b |= 0x01;
        }
        self.u8(b);
    }

    fn rex_rxb(&mut self, w: bool, reg: u8, index: u8, base: u8) {
        let mut b = 0x40;
        if w {
            b |= 0x08;
        }
        if reg >= 8 {
            b |= 0x04;
        }
        if index >= 8 {
            b |= 0x02;
        }
        if base >= 8 {
            b |= 0x01;
        }
        self.u8(b);
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.u8((md << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    // ===== Moves =====

    /// mov r64, imm64
    pub fn mov_ri64(&mut self, dst: u8, imm: u64) {
        self.rex(true, 0, dst);
        self.u8(0xB8 + (dst & 7));
        self.u64(imm);
    }

    /// mov r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: u8, imm: i32) {
        self.rex(true, 0, dst);
        self.u8(0xC7);
        self.modrm(0b11, 0, dst);
        self.u32(imm as u32);
    }

    /// mov r64, r64
    pub fn mov_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.u8(0x89);
        self.modrm(0b11, src, dst);
    }

    /// mov [rbp+disp32], r64
    pub fn store_frame(&mut self, disp: i32, src: u8) {
        self.rex(true, src, RBP);
        self.u8(0x89);
        self.modrm(0b10, src, RBP);
        self.u32(disp as u32);
    }

    /// mov r64, [rbp+disp32]
    pub fn load_frame(&mut self, dst: u8, disp: i32) {
        self.rex(true, dst, RBP);
        self.u8(0x8B);
        self.modrm(0b10, dst, RBP);
        self.u32(disp as u32);
    }

    // ===== Integer ALU =====

    /// add r64, r64
    pub fn add_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.u8(0x01);
        self.modrm(0b11, src, dst);
    }

    /// sub r64, r64
    pub fn sub_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.u8(0x29);
        self.modrm(0b11, src, dst);
    }

    /// imul r64, r64
    pub fn imul_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xAF);
        self.modrm(0b11, dst, src);
    }

    /// and/or/xor r64, r64
    pub fn alu_rr(&mut self, opcode: u8, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.u8(opcode);
        self.modrm(0b11, src, dst);
    }

    /// neg r64
    pub fn neg_r(&mut self, dst: u8) {
        self.rex(true, 0, dst);
        self.u8(0xF7);
        self.modrm(0b11, 3, dst);
    }

    /// not r64
    pub fn not_r(&mut self, dst: u8) {
        self.rex(true, 0, dst);
        self.u8(0xF7);
        self.modrm(0b11, 2, dst);
    }

    /// shl/sar/shr r64, cl — ext is the /digit (4, 7, 5)
    pub fn shift_cl(&mut self, ext: u8, dst: u8) {
        self.rex(true, 0, dst);
        self.u8(0xD3);
        self.modrm(0b11, ext, dst);
    }

    /// and r64, imm32
    pub fn and_ri(&mut self, dst: u8, imm: i32) {
        self.rex(true, 0, dst);
        self.u8(0x81);
        self.modrm(0b11, 4, dst);
        self.u32(imm as u32);
    }

    /// cmp r64, r64
    pub fn cmp_rr(&mut self, a: u8, b: u8) {
        self.rex(true, b, a);
        self.u8(0x39);
        self.modrm(0b11, b, a);
    }

    /// test r64, r64
    pub fn test_rr(&mut self, a: u8, b: u8) {
        self.rex(true, b, a);
        self.u8(0x85);
        self.modrm(0b11, b, a);
    }

    /// setcc r8 (REX ensures access to sil/dil/r8b..)
    pub fn setcc(&mut self, cc: Cc, dst: u8) {
        self.rex(false, 0, dst);
        self.u8(0x0F);
        self.u8(0x90 + cc as u8);
        self.modrm(0b11, 0, dst);
    }

    /// movzx r64, r8
    pub fn movzx_b(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xB6);
        self.modrm(0b11, dst, src);
    }

    /// movsxd r64, r32 (sign-extend the low half in place)
    pub fn movsxd(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x63);
        self.modrm(0b11, dst, src);
    }

    // ===== SSE2 scalar =====

    /// movq xmm, r64
    pub fn movq_xr(&mut self, xmm: u8, src: u8) {
        self.u8(0x66);
        self.rex(true, xmm, src);
        self.u8(0x0F);
        self.u8(0x6E);
        self.modrm(0b11, xmm, src);
    }

    /// movq r64, xmm
    pub fn movq_rx(&mut self, dst: u8, xmm: u8) {
        self.u8(0x66);
        self.rex(true, xmm, dst);
        self.u8(0x0F);
        self.u8(0x7E);
        self.modrm(0b11, xmm, dst);
    }

    /// addsd/subsd/mulsd/divsd xmm, xmm — op is 58/5C/59/5E
    pub fn sse_sd(&mut self, op: u8, dst: u8, src: u8) {
        self.u8(0xF2);
        self.u8(0x0F);
        self.u8(op);
        self.modrm(0b11, dst, src);
    }

    /// ucomisd xmm, xmm
    pub fn ucomisd(&mut self, a: u8, b: u8) {
        self.u8(0x66);
        self.u8(0x0F);
        self.u8(0x2E);
        self.modrm(0b11, a, b);
    }

    /// cvtsi2sd xmm, r64
    pub fn cvtsi2sd(&mut self, xmm: u8, src: u8) {
        self.u8(0xF2);
        self.rex(true, xmm, src);
        self.u8(0x0F);
        self.u8(0x2A);
        self.modrm(0b11, xmm, src);
    }

    /// cvttsd2si r64, xmm
    pub fn cvttsd2si(&mut self, dst: u8, xmm: u8) {
        self.u8(0xF2);
        self.rex(true, dst, xmm);
        self.u8(0x0F);
        self.u8(0x2C);
        self.modrm(0b11, dst, xmm);
    }

    /// vfmadd231sd xmm0, xmm1, xmm2 family: dst += a * b
    /// VEX.DDS.LIG.66.0F38.W1 B9 /r
    pub fn vfmadd231sd(&mut self, dst: u8, a: u8, b: u8) {
        self.u8(0xC4);
        // R=!dst[3], X=1, B=!b[3], map=0F38
        let byte1 = (if dst < 8 { 0x80 } else { 0 }) | 0x40 | (if b < 8 { 0x20 } else { 0 }) | 0x02;
        self.u8(byte1);
        // W=1, vvvv=!a, L=0, pp=01 (66)
        let byte2 = 0x80 | ((!a & 0xF) << 3) | 0x01;
        self.u8(byte2);
        self.u8(0xB9);
        self.modrm(0b11, dst, b);
    }

    // ===== SSE2 packed (2 × f64) =====

    /// movupd xmm, [base + index*8]
    pub fn movupd_load(&mut self, xmm: u8, base: u8, index: u8) {
        self.u8(0x66);
        self.rex_rxb(false, xmm, index, base);
        self.u8(0x0F);
        self.u8(0x10);
        self.modrm(0b00, xmm, 0b100); // SIB follows
        self.u8((0b11 << 6) | ((index & 7) << 3) | (base & 7)); // scale=8
    }

    /// movupd [base + index*8], xmm
    pub fn movupd_store(&mut self, base: u8, index: u8, xmm: u8) {
        self.u8(0x66);
        self.rex_rxb(false, xmm, index, base);
        self.u8(0x0F);
        self.u8(0x11);
        self.modrm(0b00, xmm, 0b100);
        self.u8((0b11 << 6) | ((index & 7) << 3) | (base & 7));
    }

    /// addpd/subpd/mulpd/divpd xmm, xmm — op is 58/5C/59/5E
    pub fn sse_pd(&mut self, op: u8, dst: u8, src: u8) {
        self.u8(0x66);
        self.u8(0x0F);
        self.u8(op);
        self.modrm(0b11, dst, src);
    }

    // ===== Control =====

    /// push r64
    pub fn push_r(&mut self, r: u8) {
        if r >= 8 {
            self.u8(0x41);
        }
        self.u8(0x50 + (r & 7));
    }

    /// pop r64
    pub fn pop_r(&mut self, r: u8) {
        if r >= 8 {
            self.u8(0x41);
        }
        self.u8(0x58 + (r & 7));
    }

    /// sub rsp, imm32
    pub fn sub_rsp(&mut self, imm: i32) {
        self.rex(true, 0, RSP);
        self.u8(0x81);
        self.modrm(0b11, 5, RSP);
        self.u32(imm as u32);
    }

    /// mov rsp, rbp; pop rbp
    pub fn leave(&mut self) {
        self.u8(0xC9);
    }

    /// ret
    pub fn ret(&mut self) {
        self.u8(0xC3);
    }

    /// ud2 (trap)
    pub fn ud2(&mut self) {
        self.u8(0x0F);
        self.u8(0x0B);
    }

    /// jmp rel32 with zeroed displacement; returns the patch site
    pub fn jmp_site(&mut self) -> usize {
        let site = self.pos();
        self.u8(0xE9);
        self.u32(0);
        site
    }

    /// jcc rel32 with zeroed displacement; returns the patch site
    pub fn jcc_site(&mut self, cc: Cc) -> usize {
        let site = self.pos();
        self.u8(0x0F);
        self.u8(0x80 + cc as u8);
        self.u32(0);
        site
    }
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}

/// The x86-64 backend.
pub struct X64Backend {
    features: X64Features,
}

impl X64Backend {
    /// Backend using the host's detected features.
    pub fn detect() -> Self {
        X64Backend { features: cpu::features().x64 }
    }

    /// Backend with an explicit feature set (tests, cross configuration).
    pub fn with_features(features: X64Features) -> Self {
        X64Backend { features }
    }
}

/// Frame geometry for one function.
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

impl Backend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn vector_lanes(&self) -> u32 {
        // 2 × f64 with SSE2; AVX widens to 4
        if self.features.avx2 {
            4
        } else {
            2
        }
    }

    fn allocatable(&self) -> Vec<PhysReg> {
        // r10/r11 are lowering scratch; rsp/rbp reserved; rbx/r12-15
        // callee-saved and left to the ABI
        [RAX, RCX, RDX, RSI, RDI, R8, R9].iter().map(|&r| PhysReg(r)).collect()
    }

    fn emit_function(
        &self,
        func: &IrFunction,
        alloc: &Allocation,
    ) -> Result<CodeBlob, CodegenError> {
        let mut asm = Asm::new();
        let mut fixups: FixupSink<X64Patch> = FixupSink::new();
        let frame = Frame::new(func, alloc);
        let mut blob = CodeBlob::default();

        // Prologue
        asm.push_r(RBP);
        asm.mov_rr(RBP, RSP);
        if frame.frame_size > 0 {
            asm.sub_rsp(frame.frame_size);
        }
        for i in 0..func.param_count.min(ARG_REGS.len() as u32) {
            asm.store_frame(frame.arg(i as i32), ARG_REGS[i as usize]);
        }

        let local_slots: Vec<PointerSlot> = (0..func.local_count as i32)
            .map(|i| PointerSlot::Frame(frame.local(i)))
            .collect();

        // One label per block
        let order = super::layout_order(func);
        let labels: rustc_hash::FxHashMap<_, _> =
            order.iter().map(|&b| (b, fixups.fresh())).collect();

        for (pos, &bid) in order.iter().enumerate() {
            let offset = asm.pos();
            fixups.bind(&mut asm.code, labels[&bid], offset)?;
            if func.loop_headers.contains(&func.block(bid).bc_start) {
                blob.osr_entries.push((func.block(bid).bc_start, asm.pos()));
            }

            let mut vec_homes: rustc_hash::FxHashMap<VReg, u8> = rustc_hash::FxHashMap::default();
            let mut next_vec: u8 = 3; // xmm0-2 are scalar scratch

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
                        let site = asm.jmp_site();
                        fixups.use_label(&mut asm.code, site, labels[t], X64Patch::Jmp)?;
                    }
                }
                Terminator::Branch { cond, then_block, else_block } => {
                    self.load_operand(&mut asm, cond, R10, alloc, &frame)?;
                    asm.test_rr(R10, R10);
                    let site = asm.jcc_site(Cc::Ne);
                    fixups.use_label(&mut asm.code, site, labels[then_block], X64Patch::Jcc)?;
                    if next != Some(*else_block) {
                        let site = asm.jmp_site();
                        fixups.use_label(&mut asm.code, site, labels[else_block], X64Patch::Jmp)?;
                    }
                }
                Terminator::Return(v) => {
                    match v {
                        Some(v) => self.load_operand(&mut asm, v, RAX, alloc, &frame)?,
                        None => asm.mov_ri32(RAX, 0),
                    }
                    asm.leave();
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
                    asm.ud2();
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

impl X64Backend {
    fn home(&self, alloc: &Allocation, frame: &Frame, reg: VReg) -> Result<(Option<u8>, i32), CodegenError> {
        match alloc.location(reg) {
            Some(Location::Reg(PhysReg(r))) => Ok((Some(r), 0)),
            Some(Location::Spill(s)) => Ok((None, frame.spill(s))),
            None => Err(CodegenError::UnsupportedInstruction(format!("unallocated {}", reg))),
        }
    }

    fn load_operand(
        &self,
        asm: &mut Asm,
        op: &Operand,
        dst: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match op {
            Operand::Imm(c) => {
                match c {
                    Const::I32(v) => asm.mov_ri32(dst, *v),
                    Const::Bool(b) => asm.mov_ri32(dst, *b as i32),
                    Const::Null | Const::Undefined => asm.mov_ri32(dst, 0),
                    Const::F64(v) => asm.mov_ri64(dst, v.to_bits()),
                    Const::Str(_) => {
                        return Err(CodegenError::UnsupportedInstruction(
                            "string immediate".to_string(),
                        ))
                    }
                }
                Ok(())
            }
            Operand::Reg(r) => {
                match self.home(alloc, frame, *r)? {
                    (Some(src), _) => {
                        if src != dst {
                            asm.mov_rr(dst, src);
                        }
                    }
                    (None, off) => asm.load_frame(dst, off),
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
        asm: &mut Asm,
        dest: VReg,
        src: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match self.home(alloc, frame, dest)? {
            (Some(d), _) => {
                if d != src {
                    asm.mov_rr(d, src);
                }
            }
            (None, off) => asm.store_frame(off, src),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instr(
        &self,
        asm: &mut Asm,
        instr: &Instr,
        alloc: &Allocation,
        frame: &Frame,
        local_slots: &[PointerSlot],
        blob: &mut CodeBlob,
        vec_homes: &mut rustc_hash::FxHashMap<VReg, u8>,
        next_vec: &mut u8,
    ) -> Result<(), CodegenError> {
        let dest = instr.dest;
        match instr.op {
            Op::Const | Op::Move => {
                let d = dest.ok_or_else(|| unsupported("const without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::BinInt(b) => {
                let d = dest.ok_or_else(|| unsupported("bin without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                match b {
                    BinOp::Add => asm.add_rr(R10, R11),
                    BinOp::Sub => asm.sub_rr(R10, R11),
                    BinOp::Mul => asm.imul_rr(R10, R11),
                    BinOp::BitAnd => asm.alu_rr(0x21, R10, R11),
                    BinOp::BitOr => asm.alu_rr(0x09, R10, R11),
                    BinOp::BitXor => asm.alu_rr(0x31, R10, R11),
                    BinOp::Shl | BinOp::Shr | BinOp::Ushr => {
                        // Shift amount lives in cl; preserve rcx around it
                        asm.push_r(RCX);
                        asm.mov_rr(RCX, R11);
                        asm.and_ri(RCX, 31);
                        let ext = match b {
                            BinOp::Shl => 4,
                            BinOp::Shr => 7,
                            _ => 5,
                        };
                        asm.shift_cl(ext, R10);
                        asm.pop_r(RCX);
                    }
                    BinOp::Div | BinOp::Mod => {
                        return Err(unsupported("int division lowers through the runtime"))
                    }
                }
                // Renormalize to int32: sign-extend the low half
                asm.movsxd(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::NegInt => {
                let d = dest.ok_or_else(|| unsupported("neg without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.neg_r(R10);
                asm.movsxd(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::BitNot => {
                let d = dest.ok_or_else(|| unsupported("bitnot without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.not_r(R10);
                asm.movsxd(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::Not => {
                let d = dest.ok_or_else(|| unsupported("not without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.test_rr(R10, R10);
                asm.setcc(Cc::E, R10);
                asm.movzx_b(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::CmpInt(c) => {
                let d = dest.ok_or_else(|| unsupported("cmp without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                asm.cmp_rr(R10, R11);
                asm.setcc(int_cc(c), R10);
                asm.movzx_b(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::BinFloat(b) => {
                let d = dest.ok_or_else(|| unsupported("fbin without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                asm.movq_xr(0, R10);
                asm.movq_xr(1, R11);
                let op = match b {
                    BinOp::Add => 0x58,
                    BinOp::Sub => 0x5C,
                    BinOp::Mul => 0x59,
                    BinOp::Div => 0x5E,
                    _ => return Err(unsupported("float bitwise")),
                };
                asm.sse_sd(op, 0, 1);
                asm.movq_rx(R10, 0);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::NegFloat => {
                let d = dest.ok_or_else(|| unsupported("fneg without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.mov_ri64(R11, 0x8000_0000_0000_0000);
                asm.alu_rr(0x31, R10, R11); // xor sign bit
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::Fma => {
                let d = dest.ok_or_else(|| unsupported("fma without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.movq_xr(1, R10);
                self.load_operand(asm, &instr.args[1], R10, alloc, frame)?;
                asm.movq_xr(2, R10);
                self.load_operand(asm, &instr.args[2], R10, alloc, frame)?;
                asm.movq_xr(0, R10);
                if self.features.fma {
                    // xmm0 += xmm1 * xmm2, fused
                    asm.vfmadd231sd(0, 1, 2);
                } else {
                    asm.sse_sd(0x59, 1, 2); // mulsd xmm1, xmm2
                    asm.sse_sd(0x58, 0, 1); // addsd xmm0, xmm1
                }
                asm.movq_rx(R10, 0);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::CmpFloat(c) => {
                let d = dest.ok_or_else(|| unsupported("fcmp without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                asm.movq_xr(0, R10);
                asm.movq_xr(1, R11);
                asm.ucomisd(0, 1);
                asm.setcc(float_cc(c), R10);
                asm.movzx_b(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::Int32ToDouble => {
                let d = dest.ok_or_else(|| unsupported("i2d without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.cvtsi2sd(0, R10);
                asm.movq_rx(R10, 0);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::DoubleToInt32 => {
                let d = dest.ok_or_else(|| unsupported("d2i without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                asm.movq_xr(0, R10);
                asm.cvttsd2si(R10, 0);
                asm.movsxd(R10, R10);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::LoadLocal | Op::LoadArg => {
                let d = dest.ok_or_else(|| unsupported("load without dest"))?;
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::LoadLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                asm.load_frame(R10, off);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::StoreLocal | Op::StoreArg => {
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::StoreLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                self.load_operand(asm, &instr.args[1], R10, alloc, frame)?;
                asm.store_frame(off, R10);
            }
            Op::GuardInt | Op::GuardFloat | Op::GuardString => {
                // The check itself runs in the boxed-value model the runtime
                // owns; the table entry is what deoptimization consumes.
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
                asm.mov_ri32(R10, self.vector_lanes() as i32);
                self.store_dest(asm, d, R10, alloc, frame)?;
            }
            Op::VecLoad => {
                let d = dest.ok_or_else(|| unsupported("vload without dest"))?;
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                let x = alloc_vec_home(vec_homes, next_vec, d)?;
                asm.movupd_load(x, R10, R11);
            }
            Op::VecStore => {
                self.load_operand(asm, &instr.args[0], R10, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], R11, alloc, frame)?;
                let x = lookup_vec_home(vec_homes, instr.args.get(2).and_then(|a| a.as_reg()))?;
                asm.movupd_store(R10, R11, x);
            }
            Op::VecBin(b) => {
                let d = dest.ok_or_else(|| unsupported("vbin without dest"))?;
                let xn = lookup_vec_home(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let xm = lookup_vec_home(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let op = match b {
                    BinOp::Add => 0x58,
                    BinOp::Sub => 0x5C,
                    BinOp::Mul => 0x59,
                    BinOp::Div => 0x5E,
                    _ => return Err(unsupported("packed bitwise")),
                };
                // Destructive two-operand form: result accumulates into xn
                asm.sse_pd(op, xn, xm);
                vec_homes.insert(d, xn);
            }
            Op::VecFma => {
                let d = dest.ok_or_else(|| unsupported("vfma without dest"))?;
                let xa = lookup_vec_home(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let xb = lookup_vec_home(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let xc = lookup_vec_home(vec_homes, instr.args.get(2).and_then(|a| a.as_reg()))?;
                // a*b + c, packed: mulpd into xa, addpd the addend
                asm.sse_pd(0x59, xa, xb);
                asm.sse_pd(0x58, xa, xc);
                vec_homes.insert(d, xa);
            }
            _ => {
                return Err(CodegenError::UnsupportedInstruction(format!("{:?}", instr.op)));
            }
        }
        Ok(())
    }
}

fn unsupported(what: &str) -> CodegenError {
    CodegenError::UnsupportedInstruction(what.to_string())
}

fn alloc_vec_home(
    homes: &mut rustc_hash::FxHashMap<VReg, u8>,
    next: &mut u8,
    reg: VReg,
) -> Result<u8, CodegenError> {
    if *next >= 16 {
        return Err(unsupported("vector register pressure"));
    }
    let x = *next;
    *next += 1;
    homes.insert(reg, x);
    Ok(x)
}

fn lookup_vec_home(
    homes: &rustc_hash::FxHashMap<VReg, u8>,
    reg: Option<VReg>,
) -> Result<u8, CodegenError> {
    reg.and_then(|r| homes.get(&r).copied())
        .ok_or_else(|| unsupported("vector operand escaped"))
}

fn imm_i32(op: &Operand) -> Result<i32, CodegenError> {
    match op {
        Operand::Imm(Const::I32(v)) => Ok(*v),
        _ => Err(unsupported("expected immediate slot index")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::JsType;
    use crate::regalloc;

    #[test]
    fn test_mov_ri32_encoding() {
        let mut a = Asm::new();
        a.mov_ri32(RAX, 7);
        assert_eq!(a.code, vec![0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_rr_encoding() {
        let mut a = Asm::new();
        a.mov_rr(RCX, RAX); // mov rcx, rax = 48 89 C1
        assert_eq!(a.code, vec![0x48, 0x89, 0xC1]);
        let mut b = Asm::new();
        b.mov_rr(R8, RDI); // REX.WB 89 F8... mov r8, rdi = 49 89 F8
        assert_eq!(b.code, vec![0x49, 0x89, 0xF8]);
    }

    #[test]
    fn test_add_and_imul_encoding() {
        let mut a = Asm::new();
        a.add_rr(RAX, RCX); // 48 01 C8
        a.imul_rr(RAX, RCX); // 48 0F AF C1
        assert_eq!(a.code, vec![0x48, 0x01, 0xC8, 0x48, 0x0F, 0xAF, 0xC1]);
    }

    #[test]
    fn test_frame_access_encoding() {
        let mut a = Asm::new();
        a.store_frame(-8, RAX); // mov [rbp-8], rax = 48 89 85 F8 FF FF FF
        assert_eq!(a.code, vec![0x48, 0x89, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_sse_encoding() {
        let mut a = Asm::new();
        a.sse_sd(0x58, 0, 1); // addsd xmm0, xmm1 = F2 0F 58 C1
        assert_eq!(a.code, vec![0xF2, 0x0F, 0x58, 0xC1]);
    }

    #[test]
    fn test_vfmadd231sd_encoding() {
        let mut a = Asm::new();
        a.vfmadd231sd(0, 1, 2); // C4 E2 F1 B9 C2
        assert_eq!(a.code, vec![0xC4, 0xE2, 0xF1, 0xB9, 0xC2]);
    }

    fn compile(func: &mut IrFunction, features: X64Features) -> CodeBlob {
        let backend = X64Backend::with_features(features);
        super::super::eliminate_phis(func);
        let alloc = regalloc::allocate(func, &backend.allocatable());
        backend.emit_function(func, &alloc).unwrap()
    }

    fn const_return_func() -> IrFunction {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 0, 0);
        let b = f.add_block(0);
        let v = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![Instr {
            op: Op::Const,
            dest: Some(v),
            args: vec![Operand::Imm(Const::I32(15))],
            bc: 0,
        }];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(v)));
        f
    }

    #[test]
    fn test_emit_const_return() {
        let mut f = const_return_func();
        let blob = compile(&mut f, X64Features { sse2: true, ..Default::default() });
        // Prologue present, function ends in leave; ret
        assert_eq!(blob.code[0], 0x55); // push rbp
        let n = blob.code.len();
        assert_eq!(&blob.code[n - 2..], &[0xC9, 0xC3]);
    }

    #[test]
    fn test_branch_gets_patched() {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let c = f.alloc_reg(JsType::Boolean);
        f.block_mut(b0).instrs = vec![Instr {
            op: Op::Const,
            dest: Some(c),
            args: vec![Operand::Imm(Const::Bool(true))],
            bc: 0,
        }];
        f.block_mut(b0).term =
            Terminator::Branch { cond: Operand::Reg(c), then_block: b2, else_block: b1 };
        f.block_mut(b1).term = Terminator::Return(Some(Operand::Imm(Const::I32(1))));
        f.block_mut(b2).term = Terminator::Return(Some(Operand::Imm(Const::I32(2))));
        f.recompute_preds();
        let blob = compile(&mut f, X64Features { sse2: true, ..Default::default() });
        // No zeroed jcc displacement survives: the 0F 8x site must carry a
        // non-zero disp (b2 is not the fallthrough)
        let pos = blob
            .code
            .windows(2)
            .position(|w| w[0] == 0x0F && (0x80..=0x8F).contains(&w[1]))
            .expect("a jcc");
        let disp = i32::from_le_bytes(blob.code[pos + 2..pos + 6].try_into().unwrap());
        assert_ne!(disp, 0);
    }

    #[test]
    fn test_fma_selected_by_feature() {
        use crate::ir::instr::*;
        let make = || {
            let mut f = IrFunction::new(0, 3, 0);
            let b = f.add_block(0);
            let x = f.alloc_reg(JsType::Float64);
            let y = f.alloc_reg(JsType::Float64);
            let z = f.alloc_reg(JsType::Float64);
            let r = f.alloc_reg(JsType::Float64);
            f.block_mut(b).instrs = vec![
                Instr { op: Op::LoadArg, dest: Some(x), args: vec![Operand::Imm(Const::I32(0))], bc: 0 },
                Instr { op: Op::LoadArg, dest: Some(y), args: vec![Operand::Imm(Const::I32(1))], bc: 1 },
                Instr { op: Op::LoadArg, dest: Some(z), args: vec![Operand::Imm(Const::I32(2))], bc: 2 },
                Instr {
                    op: Op::Fma,
                    dest: Some(r),
                    args: vec![Operand::Reg(x), Operand::Reg(y), Operand::Reg(z)],
                    bc: 3,
                },
            ];
            f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(r)));
            f
        };

        let mut with = make();
        let blob_fma =
            compile(&mut with, X64Features { sse2: true, fma: true, ..Default::default() });
        assert!(blob_fma.code.windows(2).any(|w| w == [0xC4, 0xE2]));

        let mut without = make();
        let blob_sse = compile(&mut without, X64Features { sse2: true, ..Default::default() });
        assert!(!blob_sse.code.windows(2).any(|w| w == [0xC4, 0xE2]));
        // mulsd followed by addsd instead
        assert!(blob_sse.code.windows(3).any(|w| w == [0xF2, 0x0F, 0x59]));
        assert!(blob_sse.code.windows(3).any(|w| w == [0xF2, 0x0F, 0x58]));
    }

    #[test]
    fn test_guard_records_deopt_entry() {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 1, 2);
        let b = f.add_block(0);
        let x = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::LoadArg, dest: Some(x), args: vec![Operand::Imm(Const::I32(0))], bc: 4 },
            Instr { op: Op::GuardInt, dest: None, args: vec![Operand::Reg(x)], bc: 4 },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(x)));
        let blob = compile(&mut f, X64Features { sse2: true, ..Default::default() });
        assert_eq!(blob.deopt_table.len(), 1);
        assert_eq!(blob.deopt_table[0].bc, 4);
        assert_eq!(blob.deopt_table[0].local_slots.len(), 2);
    }

    #[test]
    fn test_safepoint_marks_osr_block() {
        use crate::ir::instr::*;
        let mut f = IrFunction::new(0, 0, 1);
        let entry = f.add_block(0);
        let header = f.add_block(2);
        let exit = f.add_block(5);
        f.loop_headers = vec![2];
        f.block_mut(entry).term = Terminator::Jump(header);
        f.block_mut(header).instrs = vec![Instr { op: Op::Safepoint, dest: None, args: vec![], bc: 2 }];
        f.block_mut(header).term = Terminator::Branch {
            cond: Operand::Imm(Const::Bool(false)),
            then_block: header,
            else_block: exit,
        };
        f.block_mut(exit).term = Terminator::Return(None);
        f.recompute_preds();
        let blob = compile(&mut f, X64Features { sse2: true, ..Default::default() });
        assert_eq!(blob.osr_entries.len(), 1);
        assert_eq!(blob.osr_entries[0].0, 2);
        assert_eq!(blob.safepoints.len(), 1);
    }
}
