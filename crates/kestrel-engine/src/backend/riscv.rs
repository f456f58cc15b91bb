//! RISC-V backend (RV64 + V extension)
//!
//! Parameterized encoders for the base ISA's R/I/S/B/J formats and for the
//! vector extension: nothing hard-codes an instruction word beyond the
//! minimal opcode and funct fields. Vector state is configured with
//! `vsetvli rd, rs1, vtypei`, where vtypei packs SEW (element width) and
//! LMUL (register grouping); `VecWidth` lowers to exactly that instruction,
//! so the returned VL drives the vector loop and the scalar epilogue picks
//! up the tail. Vector memory ops run at SEW=32 over packed float buffers.
//!
//! Conditional branches reach ±4 KiB (B-type) and jumps ±1 MiB (JAL); block
//! branches therefore use a short B-type hop over a JAL, and bound targets
//! beyond B-type range get the inverted-branch long form.

use rustc_hash::FxHashMap;

use crate::ir::instr::{
    BinOp, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use crate::regalloc::{Allocation, Location, PhysReg};

use super::cpu::{self, RiscvFeatures};
use super::fixup::{FixupSink, Label, PatchKind};
use super::{
    Backend, CodeBlob, CodegenError, DeoptEntry, PointerSlot, SafepointEntry, StackMapEntry,
    TargetArch,
};

// Register numbers
const ZERO: u8 = 0;
const RA: u8 = 1;
const SP: u8 = 2;
const FP: u8 = 8; // s0
const T0: u8 = 5;
const T1: u8 = 6;
const T2: u8 = 7;

/// Argument registers a0–a7.
const ARG_REGS: [u8; 8] = [10, 11, 12, 13, 14, 15, 16, 17];

/// Element widths for vtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sew {
    /// 8-bit elements
    E8 = 0b000,
    /// 16-bit elements
    E16 = 0b001,
    /// 32-bit elements
    E32 = 0b010,
    /// 64-bit elements
    E64 = 0b011,
}

/// Register grouping for vtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lmul {
    /// LMUL = 1/8
    MF8 = 0b101,
    /// LMUL = 1/4
    MF4 = 0b110,
    /// LMUL = 1/2
    MF2 = 0b111,
    /// LMUL = 1
    M1 = 0b000,
    /// LMUL = 2
    M2 = 0b001,
    /// LMUL = 4
    M4 = 0b010,
    /// LMUL = 8
    M8 = 0b011,
}

/// Pack the vtypei immediate: mask/tail policy, SEW, LMUL.
pub fn vtype(sew: Sew, lmul: Lmul, vta: bool, vma: bool) -> u32 {
    ((vma as u32) << 7) | ((vta as u32) << 6) | ((sew as u32) << 3) | lmul as u32
}

/// Branch patch kinds.
pub enum RvPatch {
    /// B-type conditional, ±4 KiB
    BType,
    /// JAL, ±1 MiB
    Jal,
}

impl PatchKind for RvPatch {
    fn range(&self) -> i64 {
        match self {
            RvPatch::BType => 4095,
            RvPatch::Jal => 1024 * 1024 - 1,
        }
    }
    fn patch(&self, code: &mut [u8], site: usize, offset: i64) {
        let word = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
        let off = offset as i32 as u32;
        let insn = match self {
            RvPatch::BType => {
                let imm = (((off >> 12) & 1) << 31)
                    | (((off >> 5) & 0x3F) << 25)
                    | (((off >> 1) & 0xF) << 8)
                    | (((off >> 11) & 1) << 7);
                (word & 0x01FF_F07F & !0x8000_0000) | imm
            }
            RvPatch::Jal => {
                let imm = (((off >> 20) & 1) << 31)
                    | (((off >> 1) & 0x3FF) << 21)
                    | (((off >> 11) & 1) << 20)
                    | (((off >> 12) & 0xFF) << 12);
                (word & 0x0000_0FFF) | imm
            }
        };
        code[site..site + 4].copy_from_slice(&insn.to_le_bytes());
    }
}

/// RV64 word emitter.
pub struct RvAsm {
    /// Emitted bytes (little endian words)
    pub code: Vec<u8>,
}

impl RvAsm {
    /// Empty buffer.
    pub fn new() -> Self {
        RvAsm { code: Vec::new() }
    }

    /// Current offset.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Append one instruction word.
    pub fn word(&mut self, w: u32) {
        self.code.extend_from_slice(&w.to_le_bytes());
    }

    fn r_type(&mut self, funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
        self.word(
            (funct7 << 25)
                | ((rs2 as u32) << 20)
                | ((rs1 as u32) << 15)
                | (funct3 << 12)
                | ((rd as u32) << 7)
                | opcode,
        );
    }

    fn i_type(&mut self, imm12: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
        self.word(
            (((imm12 as u32) & 0xFFF) << 20)
                | ((rs1 as u32) << 15)
                | (funct3 << 12)
                | ((rd as u32) << 7)
                | opcode,
        );
    }

    fn s_type(&mut self, imm12: i32, rs2: u8, rs1: u8, funct3: u32, opcode: u32) {
        let imm = imm12 as u32;
        self.word(
            (((imm >> 5) & 0x7F) << 25)
                | ((rs2 as u32) << 20)
                | ((rs1 as u32) << 15)
                | (funct3 << 12)
                | ((imm & 0x1F) << 7)
                | opcode,
        );
    }

    // ===== Base integer =====

    /// addi rd, rs1, imm
    pub fn addi(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 0, rd, 0x13);
    }

    /// lui rd, imm20
    pub fn lui(&mut self, rd: u8, imm20: i32) {
        self.word((((imm20 as u32) & 0xFFFFF) << 12) | ((rd as u32) << 7) | 0x37);
    }

    /// Materialize a 32-bit constant (lui+addi), sign-extended.
    pub fn li32(&mut self, rd: u8, v: i32) {
        if (-2048..2048).contains(&v) {
            self.addi(rd, ZERO, v);
        } else {
            let hi = (v + 0x800) >> 12;
            let lo = v - (hi << 12);
            self.lui(rd, hi);
            if lo != 0 {
                self.addi(rd, rd, lo);
            }
        }
    }

    /// Materialize a full 64-bit constant.
    pub fn li64(&mut self, rd: u8, v: u64) {
        if v as i64 >= i32::MIN as i64 && v as i64 <= i32::MAX as i64 {
            self.li32(rd, v as i32);
            return;
        }
        // Build from the top in 11-bit steps
        self.li32(rd, (v >> 32) as i32);
        self.slli(rd, rd, 11);
        self.addi(rd, rd, ((v >> 21) & 0x7FF) as i32);
        self.slli(rd, rd, 11);
        self.addi(rd, rd, ((v >> 10) & 0x7FF) as i32);
        self.slli(rd, rd, 10);
        self.addi(rd, rd, (v & 0x3FF) as i32);
    }

    /// add/sub/mul/and/or/xor/sll/srl/sra/slt rd, rs1, rs2
    pub fn alu(&mut self, funct7: u32, funct3: u32, rd: u8, rs1: u8, rs2: u8) {
        self.r_type(funct7, rs2, rs1, funct3, rd, 0x33);
    }

    /// slli rd, rs1, shamt
    pub fn slli(&mut self, rd: u8, rs1: u8, shamt: u8) {
        self.i_type(shamt as i32, rs1, 1, rd, 0x13);
    }

    /// andi rd, rs1, imm
    pub fn andi(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 7, rd, 0x13);
    }

    /// xori rd, rs1, imm
    pub fn xori(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 4, rd, 0x13);
    }

    /// sltiu rd, rs1, imm (seqz via sltiu rd, rs, 1)
    pub fn sltiu(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 3, rd, 0x13);
    }

    /// sext.w rd, rs (addiw rd, rs, 0)
    pub fn sext_w(&mut self, rd: u8, rs1: u8) {
        self.i_type(0, rs1, 0, rd, 0x1B);
    }

    /// ld rd, imm(rs1)
    pub fn ld(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 3, rd, 0x03);
    }

    /// sd rs2, imm(rs1)
    pub fn sd(&mut self, rs2: u8, rs1: u8, imm: i32) {
        self.s_type(imm, rs2, rs1, 3, 0x23);
    }

    /// jalr rd, rs1, imm
    pub fn jalr(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 0, rd, 0x67);
    }

    /// ret (jalr x0, ra, 0)
    pub fn ret(&mut self) {
        self.jalr(ZERO, RA, 0);
    }

    /// ebreak
    pub fn ebreak(&mut self) {
        self.word(0x0010_0073);
    }

    /// B-type conditional with zeroed offset; returns site. funct3 selects
    /// beq/bne/blt/bge/bltu/bgeu.
    pub fn branch_site(&mut self, funct3: u32, rs1: u8, rs2: u8) -> usize {
        let site = self.pos();
        self.word(
            ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | 0x63,
        );
        site
    }

    /// jal rd with zeroed offset; returns site.
    pub fn jal_site(&mut self, rd: u8) -> usize {
        let site = self.pos();
        self.word(((rd as u32) << 7) | 0x6F);
        site
    }

    // ===== Double-precision float =====

    /// fld rd, imm(rs1)
    pub fn fld(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 3, rd, 0x07);
    }

    /// fsd rs2, imm(rs1)
    pub fn fsd(&mut self, rs2: u8, rs1: u8, imm: i32) {
        self.s_type(imm, rs2, rs1, 3, 0x27);
    }

    /// flw rd, imm(rs1)
    pub fn flw(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 2, rd, 0x07);
    }

    /// fsw rs2, imm(rs1)
    pub fn fsw(&mut self, rs2: u8, rs1: u8, imm: i32) {
        self.s_type(imm, rs2, rs1, 2, 0x27);
    }

    /// fcvt.d.s fd, fs (single → double, exact)
    pub fn fcvt_d_s(&mut self, fd: u8, fs: u8) {
        self.r_type(0x21, 0, fs, 0, fd, 0x53);
    }

    /// fcvt.s.d fd, fs (double → single, dynamic rounding)
    pub fn fcvt_s_d(&mut self, fd: u8, fs: u8) {
        self.r_type(0x20, 1, fs, 0b111, fd, 0x53);
    }

    /// fmv.d.x fd, rs
    pub fn fmv_d_x(&mut self, fd: u8, rs: u8) {
        self.r_type(0x79, 0, rs, 0, fd, 0x53);
    }

    /// fmv.x.d rd, fs
    pub fn fmv_x_d(&mut self, rd: u8, fs: u8) {
        self.r_type(0x71, 0, fs, 0, rd, 0x53);
    }

    /// fadd.d/fsub.d/fmul.d/fdiv.d fd, fs1, fs2 (dynamic rounding)
    pub fn fbin_d(&mut self, funct7: u32, fd: u8, fs1: u8, fs2: u8) {
        self.r_type(funct7, fs2, fs1, 0b111, fd, 0x53);
    }

    /// fmadd.d fd, fs1, fs2, fs3 (fd = fs1*fs2 + fs3)
    pub fn fmadd_d(&mut self, fd: u8, fs1: u8, fs2: u8, fs3: u8) {
        self.word(
            ((fs3 as u32) << 27)
                | (0b01 << 25)
                | ((fs2 as u32) << 20)
                | ((fs1 as u32) << 15)
                | (0b111 << 12)
                | ((fd as u32) << 7)
                | 0x43,
        );
    }

    /// feq.d/flt.d/fle.d rd, fs1, fs2 — funct3 2/1/0
    pub fn fcmp_d(&mut self, funct3: u32, rd: u8, fs1: u8, fs2: u8) {
        self.r_type(0x51, fs2, fs1, funct3, rd, 0x53);
    }

    /// fcvt.d.w fd, rs (int32 → double)
    pub fn fcvt_d_w(&mut self, fd: u8, rs: u8) {
        self.r_type(0x69, 0, rs, 0, fd, 0x53);
    }

    /// fcvt.w.d rd, fs, rtz
    pub fn fcvt_w_d(&mut self, rd: u8, fs: u8) {
        self.r_type(0x61, 0, fs, 0b001, rd, 0x53);
    }

    /// fsgnjn.d fd, fs, fs (fneg.d)
    pub fn fneg_d(&mut self, fd: u8, fs: u8) {
        self.r_type(0x11, fs, fs, 0b001, fd, 0x53);
    }

    // ===== Vector extension =====

    /// vsetvli rd, rs1, vtypei
    pub fn vsetvli(&mut self, rd: u8, rs1: u8, vtypei: u32) {
        self.word(
            ((vtypei & 0x7FF) << 20)
                | ((rs1 as u32) << 15)
                | (0b111 << 12)
                | ((rd as u32) << 7)
                | 0x57,
        );
    }

    /// Unit-stride vector load: vle{width}.v vd, (rs1)
    pub fn vle(&mut self, width: u32, vd: u8, rs1: u8) {
        self.word(
            (1 << 25) // vm = 1 (unmasked)
                | ((rs1 as u32) << 15)
                | (width_funct3(width) << 12)
                | ((vd as u32) << 7)
                | 0x07,
        );
    }

    /// Unit-stride vector store: vse{width}.v vs3, (rs1)
    pub fn vse(&mut self, width: u32, vs3: u8, rs1: u8) {
        self.word(
            (1 << 25)
                | ((rs1 as u32) << 15)
                | (width_funct3(width) << 12)
                | ((vs3 as u32) << 7)
                | 0x27,
        );
    }

    /// Strided vector load: vlse{width}.v vd, (rs1), rs2
    pub fn vlse(&mut self, width: u32, vd: u8, rs1: u8, rs2: u8) {
        self.word(
            (0b10 << 26) // mop = strided
                | (1 << 25)
                | ((rs2 as u32) << 20)
                | ((rs1 as u32) << 15)
                | (width_funct3(width) << 12)
                | ((vd as u32) << 7)
                | 0x07,
        );
    }

    /// Strided vector store: vsse{width}.v vs3, (rs1), rs2
    pub fn vsse(&mut self, width: u32, vs3: u8, rs1: u8, rs2: u8) {
        self.word(
            (0b10 << 26)
                | (1 << 25)
                | ((rs2 as u32) << 20)
                | ((rs1 as u32) << 15)
                | (width_funct3(width) << 12)
                | ((vs3 as u32) << 7)
                | 0x27,
        );
    }

    /// Integer vector-vector op (OPIVV): funct6 selects vadd/vsub/vmseq/…
    pub fn opivv(&mut self, funct6: u32, vd: u8, vs2: u8, vs1: u8) {
        self.word(
            (funct6 << 26)
                | (1 << 25)
                | ((vs2 as u32) << 20)
                | ((vs1 as u32) << 15)
                | (0b000 << 12)
                | ((vd as u32) << 7)
                | 0x57,
        );
    }

    /// Float vector-vector op (OPFVV): funct6 selects vfadd/vfmul/vfmacc/…
    pub fn opfvv(&mut self, funct6: u32, vd: u8, vs2: u8, vs1: u8) {
        self.word(
            (funct6 << 26)
                | (1 << 25)
                | ((vs2 as u32) << 20)
                | ((vs1 as u32) << 15)
                | (0b001 << 12)
                | ((vd as u32) << 7)
                | 0x57,
        );
    }

    /// Integer vector-scalar op (OPIVX): vslideup.vx / vslidedown.vx / …
    pub fn opivx(&mut self, funct6: u32, vd: u8, vs2: u8, rs1: u8) {
        self.word(
            (funct6 << 26)
                | (1 << 25)
                | ((vs2 as u32) << 20)
                | ((rs1 as u32) << 15)
                | (0b100 << 12)
                | ((vd as u32) << 7)
                | 0x57,
        );
    }

    /// vmv.v.v vd, vs1 (whole-register value copy)
    pub fn vmv_v_v(&mut self, vd: u8, vs1: u8) {
        self.word(
            (0b010111 << 26)
                | (1 << 25)
                | ((vs1 as u32) << 15)
                | ((vd as u32) << 7)
                | 0x57,
        );
    }

    /// Reduction op (OPMVV): vredsum.vs vd, vs2, vs1
    pub fn opmvv(&mut self, funct6: u32, vd: u8, vs2: u8, vs1: u8) {
        self.word(
            (funct6 << 26)
                | (1 << 25)
                | ((vs2 as u32) << 20)
                | ((vs1 as u32) << 15)
                | (0b010 << 12)
                | ((vd as u32) << 7)
                | 0x57,
        );
    }
}

impl Default for RvAsm {
    fn default() -> Self {
        Self::new()
    }
}

fn width_funct3(width: u32) -> u32 {
    match width {
        8 => 0b000,
        16 => 0b101,
        32 => 0b110,
        _ => 0b111, // 64
    }
}

/// Common vector opcode funct6 values.
pub mod vfunct6 {
    /// vadd.vv
    pub const VADD: u32 = 0b000000;
    /// vsub.vv
    pub const VSUB: u32 = 0b000010;
    /// vmseq.vv
    pub const VMSEQ: u32 = 0b011000;
    /// vslideup.vx
    pub const VSLIDEUP: u32 = 0b001110;
    /// vslidedown.vx
    pub const VSLIDEDOWN: u32 = 0b001111;
    /// vfadd.vv
    pub const VFADD: u32 = 0b000000;
    /// vfsub.vv
    pub const VFSUB: u32 = 0b000010;
    /// vfmul.vv
    pub const VFMUL: u32 = 0b100100;
    /// vfdiv.vv
    pub const VFDIV: u32 = 0b100000;
    /// vfmacc.vv (vd += vs1 * vs2)
    pub const VFMACC: u32 = 0b101100;
    /// vredsum.vs
    pub const VREDSUM: u32 = 0b000000;
    /// vfredusum.vs
    pub const VFREDUSUM: u32 = 0b000001;
}

/// The RISC-V backend.
pub struct RiscvBackend {
    features: RiscvFeatures,
}

impl RiscvBackend {
    /// Backend with host/assumed features.
    pub fn detect() -> Self {
        RiscvBackend { features: cpu::features().riscv }
    }

    /// Backend with explicit features.
    pub fn with_features(features: RiscvFeatures) -> Self {
        RiscvBackend { features }
    }

    /// Emit a conditional branch (funct3 semantics) to a bound offset,
    /// falling back to the inverted-condition + JAL long form past ±4 KiB.
    pub fn emit_branch_to(&self, asm: &mut RvAsm, funct3: u32, rs1: u8, rs2: u8, target: usize) {
        let offset = target as i64 - asm.pos() as i64;
        if (-4096..4096).contains(&offset) {
            let site = asm.branch_site(funct3, rs1, rs2);
            RvPatch::BType.patch(&mut asm.code, site, offset);
        } else {
            // Inverted condition skips the long-range jal
            let inv = funct3 ^ 1;
            let skip = asm.branch_site(inv, rs1, rs2);
            RvPatch::BType.patch(&mut asm.code, skip, 8);
            let site = asm.jal_site(ZERO);
            let offset = target as i64 - site as i64;
            RvPatch::Jal.patch(&mut asm.code, site, offset);
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

impl Backend for RiscvBackend {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn arch(&self) -> TargetArch {
        TargetArch::Riscv64
    }

    fn vector_lanes(&self) -> u32 {
        if self.features.vector {
            // SEW=32, LMUL=1
            self.features.vlen_bits / 32
        } else {
            1
        }
    }

    fn allocatable(&self) -> Vec<PhysReg> {
        // a0–a7 and t3–t6; t0–t2 are lowering scratch, s-registers stay
        // callee-saved, x0/ra/sp/gp/tp/fp pinned
        let mut regs: Vec<PhysReg> = ARG_REGS.iter().map(|&r| PhysReg(r)).collect();
        regs.extend((28u8..=31).map(PhysReg));
        regs
    }

    fn emit_function(
        &self,
        func: &IrFunction,
        alloc: &Allocation,
    ) -> Result<CodeBlob, CodegenError> {
        let mut asm = RvAsm::new();
        let mut fixups: FixupSink<RvPatch> = FixupSink::new();
        let frame = Frame::new(func, alloc);
        let mut blob = CodeBlob::default();

        // Prologue
        let total = frame.frame_size + 16;
        asm.addi(SP, SP, -total);
        asm.sd(RA, SP, total - 8);
        asm.sd(FP, SP, total - 16);
        asm.addi(FP, SP, total);
        for i in 0..func.param_count.min(8) {
            asm.sd(ARG_REGS[i as usize], FP, frame.arg(i as i32));
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
            let mut next_vec: u8 = 8; // v8.. leaves v0 for masks

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
                        let site = asm.jal_site(ZERO);
                        fixups.use_label(&mut asm.code, site, labels[t], RvPatch::Jal)?;
                    }
                }
                Terminator::Branch { cond, then_block, else_block } => {
                    self.load_operand(&mut asm, cond, T0, alloc, &frame)?;
                    // beq t0, x0, +8 skips the taken-path jal, keeping full
                    // JAL reach for both edges
                    let skip = asm.branch_site(0b000, T0, ZERO);
                    RvPatch::BType.patch(&mut asm.code, skip, 8);
                    let site = asm.jal_site(ZERO);
                    fixups.use_label(&mut asm.code, site, labels[then_block], RvPatch::Jal)?;
                    if next != Some(*else_block) {
                        let site = asm.jal_site(ZERO);
                        fixups.use_label(&mut asm.code, site, labels[else_block], RvPatch::Jal)?;
                    }
                }
                Terminator::Return(v) => {
                    match v {
                        Some(v) => self.load_operand(&mut asm, v, ARG_REGS[0], alloc, &frame)?,
                        None => asm.addi(ARG_REGS[0], ZERO, 0),
                    }
                    asm.ld(RA, SP, total - 8);
                    asm.ld(FP, SP, total - 16);
                    asm.addi(SP, SP, total);
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
                    asm.ebreak();
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

impl RiscvBackend {
    fn load_operand(
        &self,
        asm: &mut RvAsm,
        op: &Operand,
        dst: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match op {
            Operand::Imm(c) => {
                match c {
                    Const::I32(v) => asm.li32(dst, *v),
                    Const::Bool(b) => asm.addi(dst, ZERO, *b as i32),
                    Const::Null | Const::Undefined => asm.addi(dst, ZERO, 0),
                    Const::F64(v) => asm.li64(dst, v.to_bits()),
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
                            asm.addi(dst, src, 0);
                        }
                    }
                    Some(Location::Spill(s)) => asm.ld(dst, FP, frame.spill(s)),
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
        asm: &mut RvAsm,
        dest: VReg,
        src: u8,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        match alloc.location(dest) {
            Some(Location::Reg(PhysReg(d))) => {
                if d != src {
                    asm.addi(d, src, 0);
                }
                Ok(())
            }
            Some(Location::Spill(s)) => {
                asm.sd(src, FP, frame.spill(s));
                Ok(())
            }
            None => Err(CodegenError::UnsupportedInstruction(format!("unallocated {}", dest))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_instr(
        &self,
        asm: &mut RvAsm,
        instr: &Instr,
        alloc: &Allocation,
        frame: &Frame,
        local_slots: &[PointerSlot],
        blob: &mut CodeBlob,
        vec_homes: &mut FxHashMap<VReg, u8>,
        next_vec: &mut u8,
    ) -> Result<(), CodegenError> {
        let unsupported = |what: &str| CodegenError::UnsupportedInstruction(what.to_string());
        let dest = instr.dest;
        match instr.op {
            Op::Const | Op::Move => {
                let d = dest.ok_or_else(|| unsupported("value without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::BinInt(b) => {
                let d = dest.ok_or_else(|| unsupported("bin without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], T1, alloc, frame)?;
                match b {
                    BinOp::Add => asm.alu(0, 0, T0, T0, T1),
                    BinOp::Sub => asm.alu(0x20, 0, T0, T0, T1),
                    BinOp::Mul => asm.alu(0x01, 0, T0, T0, T1),
                    BinOp::BitAnd => asm.alu(0, 7, T0, T0, T1),
                    BinOp::BitOr => asm.alu(0, 6, T0, T0, T1),
                    BinOp::BitXor => asm.alu(0, 4, T0, T0, T1),
                    BinOp::Shl => {
                        asm.andi(T1, T1, 31);
                        asm.alu(0, 1, T0, T0, T1);
                    }
                    BinOp::Shr => {
                        asm.andi(T1, T1, 31);
                        asm.alu(0x20, 5, T0, T0, T1);
                    }
                    BinOp::Ushr => {
                        asm.andi(T1, T1, 31);
                        asm.alu(0, 5, T0, T0, T1);
                    }
                    BinOp::Div | BinOp::Mod => {
                        return Err(unsupported("int division lowers through the runtime"))
                    }
                }
                asm.sext_w(T0, T0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::NegInt => {
                let d = dest.ok_or_else(|| unsupported("neg without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.alu(0x20, 0, T0, ZERO, T0); // sub t0, zero, t0
                asm.sext_w(T0, T0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::BitNot => {
                let d = dest.ok_or_else(|| unsupported("bitnot without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.xori(T0, T0, -1);
                asm.sext_w(T0, T0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::Not => {
                let d = dest.ok_or_else(|| unsupported("not without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.sltiu(T0, T0, 1); // seqz
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::CmpInt(c) => {
                let d = dest.ok_or_else(|| unsupported("cmp without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], T1, alloc, frame)?;
                match c {
                    CmpOp::Lt => asm.alu(0, 2, T0, T0, T1), // slt
                    CmpOp::Gt => asm.alu(0, 2, T0, T1, T0),
                    CmpOp::Ge => {
                        asm.alu(0, 2, T0, T0, T1);
                        asm.xori(T0, T0, 1);
                    }
                    CmpOp::Le => {
                        asm.alu(0, 2, T0, T1, T0);
                        asm.xori(T0, T0, 1);
                    }
                    CmpOp::Eq | CmpOp::StrictEq => {
                        asm.alu(0, 4, T0, T0, T1); // xor
                        asm.sltiu(T0, T0, 1); // seqz
                    }
                    CmpOp::Ne | CmpOp::StrictNe => {
                        asm.alu(0, 4, T0, T0, T1);
                        asm.alu(0, 3, T0, ZERO, T0); // sltu x0, t0 → snez
                    }
                }
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::BinFloat(b) => {
                let d = dest.ok_or_else(|| unsupported("fbin without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], T1, alloc, frame)?;
                asm.fmv_d_x(0, T0);
                asm.fmv_d_x(1, T1);
                let funct7 = match b {
                    BinOp::Add => 0x01,
                    BinOp::Sub => 0x05,
                    BinOp::Mul => 0x09,
                    BinOp::Div => 0x0D,
                    _ => return Err(unsupported("float bitwise")),
                };
                asm.fbin_d(funct7, 0, 0, 1);
                asm.fmv_x_d(T0, 0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::NegFloat => {
                let d = dest.ok_or_else(|| unsupported("fneg without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.fmv_d_x(0, T0);
                asm.fneg_d(0, 0);
                asm.fmv_x_d(T0, 0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::Fma => {
                let d = dest.ok_or_else(|| unsupported("fma without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.fmv_d_x(0, T0);
                self.load_operand(asm, &instr.args[1], T0, alloc, frame)?;
                asm.fmv_d_x(1, T0);
                self.load_operand(asm, &instr.args[2], T0, alloc, frame)?;
                asm.fmv_d_x(2, T0);
                asm.fmadd_d(0, 0, 1, 2);
                asm.fmv_x_d(T0, 0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::CmpFloat(c) => {
                let d = dest.ok_or_else(|| unsupported("fcmp without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                self.load_operand(asm, &instr.args[1], T1, alloc, frame)?;
                asm.fmv_d_x(0, T0);
                asm.fmv_d_x(1, T1);
                match c {
                    CmpOp::Eq | CmpOp::StrictEq => asm.fcmp_d(2, T0, 0, 1),
                    CmpOp::Ne | CmpOp::StrictNe => {
                        asm.fcmp_d(2, T0, 0, 1);
                        asm.xori(T0, T0, 1);
                    }
                    CmpOp::Lt => asm.fcmp_d(1, T0, 0, 1),
                    CmpOp::Le => asm.fcmp_d(0, T0, 0, 1),
                    CmpOp::Gt => asm.fcmp_d(1, T0, 1, 0),
                    CmpOp::Ge => asm.fcmp_d(0, T0, 1, 0),
                }
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::Int32ToDouble => {
                let d = dest.ok_or_else(|| unsupported("i2d without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.fcvt_d_w(0, T0);
                asm.fmv_x_d(T0, 0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::DoubleToInt32 => {
                let d = dest.ok_or_else(|| unsupported("d2i without dest"))?;
                self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
                asm.fmv_d_x(0, T0);
                asm.fcvt_w_d(T0, 0);
                asm.sext_w(T0, T0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::LoadLocal | Op::LoadArg => {
                let d = dest.ok_or_else(|| unsupported("load without dest"))?;
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::LoadLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                asm.ld(T0, FP, off);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::StoreLocal | Op::StoreArg => {
                let slot = imm_i32(&instr.args[0])?;
                let off = if instr.op == Op::StoreLocal {
                    frame.local(slot)
                } else {
                    frame.arg(slot)
                };
                self.load_operand(asm, &instr.args[1], T0, alloc, frame)?;
                asm.sd(T0, FP, off);
            }
            // Scalar element access over packed f32 buffers: the epilogue
            // form of the vector loop's memory operations
            Op::GetElem => {
                let d = dest.ok_or_else(|| unsupported("get_elem without dest"))?;
                self.vec_addr(asm, instr, alloc, frame)?;
                asm.flw(0, T0, 0);
                asm.fcvt_d_s(0, 0);
                asm.fmv_x_d(T0, 0);
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::SetElem => {
                self.vec_addr(asm, instr, alloc, frame)?;
                self.load_operand(asm, &instr.args[2], T1, alloc, frame)?;
                asm.fmv_d_x(0, T1);
                asm.fcvt_s_d(0, 0);
                asm.fsw(0, T0, 0);
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
                if !self.features.vector {
                    return Err(unsupported("vector extension absent"));
                }
                let d = dest.ok_or_else(|| unsupported("vwidth without dest"))?;
                // vsetvli t0, x0, e32/m1 → t0 = VLMAX; VL drives the loop
                asm.vsetvli(T0, ZERO, vtype(Sew::E32, Lmul::M1, false, false));
                self.store_dest(asm, d, T0, alloc, frame)?;
            }
            Op::VecLoad => {
                let d = dest.ok_or_else(|| unsupported("vload without dest"))?;
                self.vec_addr(asm, instr, alloc, frame)?;
                let v = alloc_vec(vec_homes, next_vec, d)?;
                asm.vle(32, v, T0);
            }
            Op::VecStore => {
                self.vec_addr(asm, instr, alloc, frame)?;
                let v = lookup_vec(vec_homes, instr.args.get(2).and_then(|a| a.as_reg()))?;
                asm.vse(32, v, T0);
            }
            Op::VecBin(b) => {
                let d = dest.ok_or_else(|| unsupported("vbin without dest"))?;
                let vs2 = lookup_vec(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let vs1 = lookup_vec(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let vd = alloc_vec(vec_homes, next_vec, d)?;
                let funct6 = match b {
                    BinOp::Add => vfunct6::VFADD,
                    BinOp::Sub => vfunct6::VFSUB,
                    BinOp::Mul => vfunct6::VFMUL,
                    BinOp::Div => vfunct6::VFDIV,
                    _ => return Err(unsupported("vector bitwise")),
                };
                asm.opfvv(funct6, vd, vs2, vs1);
            }
            Op::VecFma => {
                let d = dest.ok_or_else(|| unsupported("vfma without dest"))?;
                let va = lookup_vec(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let vb = lookup_vec(vec_homes, instr.args.get(1).and_then(|a| a.as_reg()))?;
                let vc = lookup_vec(vec_homes, instr.args.get(2).and_then(|a| a.as_reg()))?;
                // vfmacc accumulates in place; copy the addend first
                let vd = alloc_vec(vec_homes, next_vec, d)?;
                asm.vmv_v_v(vd, vc);
                asm.opfvv(vfunct6::VFMACC, vd, vb, va);
            }
            Op::VecReduceSum => {
                let d = dest.ok_or_else(|| unsupported("vredsum without dest"))?;
                let vs = lookup_vec(vec_homes, instr.args.first().and_then(|a| a.as_reg()))?;
                let vd = alloc_vec(vec_homes, next_vec, d)?;
                asm.opfvv(vfunct6::VFREDUSUM, vd, vs, vd);
            }
            _ => return Err(CodegenError::UnsupportedInstruction(format!("{:?}", instr.op))),
        }
        Ok(())
    }

    /// Compute base + index*4 into t0 (SEW=32 buffers).
    fn vec_addr(
        &self,
        asm: &mut RvAsm,
        instr: &Instr,
        alloc: &Allocation,
        frame: &Frame,
    ) -> Result<(), CodegenError> {
        self.load_operand(asm, &instr.args[0], T0, alloc, frame)?;
        self.load_operand(asm, &instr.args[1], T1, alloc, frame)?;
        asm.slli(T2, T1, 2);
        asm.alu(0, 0, T0, T0, T2);
        Ok(())
    }
}

fn alloc_vec(
    homes: &mut FxHashMap<VReg, u8>,
    next: &mut u8,
    reg: VReg,
) -> Result<u8, CodegenError> {
    if *next >= 24 {
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
