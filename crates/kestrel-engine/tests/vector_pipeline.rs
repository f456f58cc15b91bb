//! The vectorization pipeline end to end: a triad loop in IR goes through
//! the full optimization level and the RISC-V backend, producing one
//! `vsetvli`, a vector load/FMA/store body, and the scalar epilogue.

use kestrel_engine::backend::riscv::{vfunct6, RiscvBackend, Sew};
use kestrel_engine::backend::{eliminate_phis, Backend, TargetArch};
use kestrel_engine::backend::cpu::RiscvFeatures;
use kestrel_engine::ir::instr::{
    BinOp, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator,
};
use kestrel_engine::ir::JsType;
use kestrel_engine::opt::{OptLevel, PassCtx, Pipeline};
use kestrel_engine::regalloc;

/// Build `for (i = 0; i < n; i++) dst[i] = a[i] * b[i] + c[i]` directly in
/// IR, in the shape the bytecode builder produces (locals through explicit
/// load/store, one header and one body block).
fn triad_ir() -> IrFunction {
    let mut f = IrFunction::new(0, 5, 1);
    let entry = f.add_block(0);
    let header = f.add_block(1);
    let body = f.add_block(2);
    let exit = f.add_block(3);
    f.loop_headers = vec![1];

    let n = f.alloc_reg(JsType::Int32);
    let zero = f.alloc_reg(JsType::Int32);
    f.block_mut(entry).instrs = vec![
        Instr { op: Op::LoadArg, dest: Some(n), args: vec![Operand::Imm(Const::I32(4))], bc: 0 },
        Instr { op: Op::Const, dest: Some(zero), args: vec![Operand::Imm(Const::I32(0))], bc: 0 },
        Instr {
            op: Op::StoreLocal,
            dest: None,
            args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(zero)],
            bc: 0,
        },
    ];
    f.block_mut(entry).term = Terminator::Jump(header);

    let i = f.alloc_reg(JsType::Int32);
    let cond = f.alloc_reg(JsType::Boolean);
    f.block_mut(header).instrs = vec![
        Instr { op: Op::LoadLocal, dest: Some(i), args: vec![Operand::Imm(Const::I32(0))], bc: 1 },
        Instr {
            op: Op::CmpInt(CmpOp::Lt),
            dest: Some(cond),
            args: vec![Operand::Reg(i), Operand::Reg(n)],
            bc: 2,
        },
    ];
    f.block_mut(header).term =
        Terminator::Branch { cond: Operand::Reg(cond), then_block: body, else_block: exit };

    let bi = f.alloc_reg(JsType::Int32);
    let arrays: Vec<_> = (0..4).map(|_| f.alloc_reg(JsType::Array)).collect();
    let av = f.alloc_reg(JsType::Float64);
    let bv = f.alloc_reg(JsType::Float64);
    let cv = f.alloc_reg(JsType::Float64);
    let prod = f.alloc_reg(JsType::Float64);
    let sum = f.alloc_reg(JsType::Float64);
    let inc = f.alloc_reg(JsType::Int32);
    let mut instrs = vec![Instr {
        op: Op::LoadLocal,
        dest: Some(bi),
        args: vec![Operand::Imm(Const::I32(0))],
        bc: 3,
    }];
    for (k, &arr) in arrays.iter().enumerate() {
        instrs.push(Instr {
            op: Op::LoadArg,
            dest: Some(arr),
            args: vec![Operand::Imm(Const::I32(k as i32))],
            bc: 3,
        });
    }
    for (k, (&arr, dst)) in arrays[..3].iter().zip([av, bv, cv]).enumerate() {
        instrs.push(Instr {
            op: Op::GetElem,
            dest: Some(dst),
            args: vec![Operand::Reg(arr), Operand::Reg(bi)],
            bc: 4 + k as u32,
        });
    }
    // Written as mul+add so the combiner has to discover the FMA
    instrs.push(Instr {
        op: Op::BinFloat(BinOp::Mul),
        dest: Some(prod),
        args: vec![Operand::Reg(av), Operand::Reg(bv)],
        bc: 7,
    });
    instrs.push(Instr {
        op: Op::BinFloat(BinOp::Add),
        dest: Some(sum),
        args: vec![Operand::Reg(prod), Operand::Reg(cv)],
        bc: 8,
    });
    instrs.push(Instr {
        op: Op::SetElem,
        dest: None,
        args: vec![Operand::Reg(arrays[3]), Operand::Reg(bi), Operand::Reg(sum)],
        bc: 9,
    });
    instrs.push(Instr {
        op: Op::BinInt(BinOp::Add),
        dest: Some(inc),
        args: vec![Operand::Reg(bi), Operand::Imm(Const::I32(1))],
        bc: 10,
    });
    instrs.push(Instr {
        op: Op::StoreLocal,
        dest: None,
        args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(inc)],
        bc: 11,
    });
    f.block_mut(body).instrs = instrs;
    f.block_mut(body).term = Terminator::Jump(header);
    f.block_mut(exit).term = Terminator::Return(None);
    f.recompute_preds();
    f
}

#[test]
fn test_full_pipeline_emits_rvv_triad() {
    let mut ir = triad_ir();

    let pipeline = Pipeline::for_level(OptLevel::Full);
    pipeline.optimize(&mut ir, &PassCtx::bare(TargetArch::Riscv64));

    // The vectorizer produced a widened body plus the scalar epilogue
    assert!(ir
        .blocks
        .iter()
        .any(|b| b.instrs.iter().any(|i| matches!(i.op, Op::VecFma | Op::VecBin(_)))));
    assert!(ir
        .blocks
        .iter()
        .any(|b| b.instrs.iter().any(|i| matches!(i.op, Op::Fma | Op::BinFloat(_)))));

    let backend = RiscvBackend::with_features(RiscvFeatures {
        bitmanip: false,
        vector: true,
        vlen_bits: 128,
    });
    assert!(backend.vector_lanes() > 1, "VL must exceed 1 at SEW=32");

    eliminate_phis(&mut ir);
    let alloc = regalloc::allocate(&ir, &backend.allocatable());
    let blob = backend.emit_function(&ir, &alloc).unwrap();

    let words: Vec<u32> = blob
        .code
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    // One vsetvli per vector-loop entry, configured for SEW=32
    let vsetvlis: Vec<u32> = words
        .iter()
        .copied()
        .filter(|&w| w & 0x7F == 0x57 && (w >> 12) & 0x7 == 0b111 && w >> 31 == 0)
        .collect();
    assert!(!vsetvlis.is_empty());
    for w in &vsetvlis {
        assert_eq!((w >> 20) & 0x38, (Sew::E32 as u32) << 3);
    }

    // Vector loads, a fused multiply-accumulate, and a vector store
    assert!(words.iter().filter(|&&w| w & 0x7F == 0x07 && (w >> 12) & 7 == 0b110).count() >= 3);
    assert!(words
        .iter()
        .any(|&w| w & 0x7F == 0x57
            && (w >> 26) & 0x3F == vfunct6::VFMACC
            && (w >> 12) & 7 == 0b001));
    assert!(words.iter().any(|&w| w & 0x7F == 0x27 && (w >> 12) & 7 == 0b110));
}

#[test]
fn test_scalar_epilogue_remains_scalar() {
    let mut ir = triad_ir();
    let pipeline = Pipeline::for_level(OptLevel::Full);
    pipeline.optimize(&mut ir, &PassCtx::bare(TargetArch::Riscv64));

    // The original loop blocks survive with scalar element accesses for the
    // tail iterations
    let scalar_accesses = ir
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .filter(|i| matches!(i.op, Op::GetElem | Op::SetElem))
        .count();
    assert!(scalar_accesses >= 4, "epilogue must keep the scalar accesses");
}
