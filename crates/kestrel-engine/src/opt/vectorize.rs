//! Vectorization opportunity detection
//!
//! Loops that walk arrays with unit stride, perform only lane-wise float
//! arithmetic, and have no calls or early exits get a vector version: a new
//! header checks that a full vector of lanes remains, the cloned body uses
//! the vector operations, and the original scalar loop runs as the epilogue
//! for the tail (`count mod vector-width` iterations). The backend picks the
//! widest supported unit and materializes `VecWidth`.

use rustc_hash::FxHashMap;

use crate::ir::instr::{
    BinOp, BlockId, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use crate::ir::types::JsType;

use super::analysis::natural_loops;
use super::{Pass, PassCtx};

/// The vectorization pass.
pub struct Vectorization;

impl Pass for Vectorization {
    fn name(&self) -> &'static str {
        "vectorize"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let loops = natural_loops(func);
        let mut changed = false;
        for l in &loops {
            if let Some(plan) = match_vector_loop(func, l.header, &l.body) {
                apply(func, &plan);
                changed = true;
            }
        }
        changed
    }
}

/// Everything needed to build the vector version of one loop.
struct VectorPlan {
    header: BlockId,
    body: BlockId,
    /// Local slot of the induction variable
    induction_slot: i32,
    /// Loop bound operand (invariant)
    bound: Operand,
}

/// Recognize the canonical counted loop:
/// header: `i = load_local L; c = icmp.lt i, bound; branch c, body, exit`
/// body:   unit-stride element loads, float arithmetic, unit-stride element
///         stores, `store_local L, i+1`, jump header.
fn match_vector_loop(
    func: &IrFunction,
    header: BlockId,
    body_set: &rustc_hash::FxHashSet<BlockId>,
) -> Option<VectorPlan> {
    if body_set.len() != 2 {
        return None;
    }
    let body = *body_set.iter().find(|&&b| b != header)?;

    // Header shape
    let h = func.block(header);
    let mut induction_slot: Option<i32> = None;
    let mut iv_reg: Option<VReg> = None;
    let mut bound: Option<Operand> = None;
    let mut cond_reg: Option<VReg> = None;
    for instr in &h.instrs {
        match instr.op {
            Op::Safepoint => {}
            Op::LoadLocal => {
                if iv_reg.is_some() {
                    return None;
                }
                if let Some(Operand::Imm(Const::I32(slot))) = instr.args.first() {
                    induction_slot = Some(*slot);
                    iv_reg = instr.dest;
                }
            }
            Op::CmpInt(CmpOp::Lt) | Op::Cmp(CmpOp::Lt) => {
                if instr.args.first().and_then(|a| a.as_reg()) != iv_reg {
                    return None;
                }
                let b = *instr.args.get(1)?;
                // The bound must be invariant: an immediate or a register
                // defined outside the loop
                if let Operand::Reg(r) = b {
                    let defined_in_loop = body_set.iter().any(|&bid| {
                        func.block(bid).instrs.iter().any(|i| i.dest == Some(r))
                    });
                    if defined_in_loop {
                        return None;
                    }
                }
                bound = Some(b);
                cond_reg = instr.dest;
            }
            _ => return None,
        }
    }
    let (induction_slot, iv_reg, bound) = (induction_slot?, iv_reg?, bound?);
    match &h.term {
        Terminator::Branch { cond, then_block, .. }
            if cond.as_reg() == cond_reg && *then_block == body => {}
        _ => return None,
    }

    // Body shape: only lane-safe operations, unit-stride accesses through the
    // induction value, one induction update, back-edge to the header.
    let b = func.block(body);
    if b.term != Terminator::Jump(header) {
        return None;
    }
    let mut body_iv: Option<VReg> = None; // the LoadLocal of the induction var in the body
    let mut updated = false;
    let mut update_reg: Option<VReg> = None;
    for instr in &b.instrs {
        match instr.op {
            Op::LoadLocal => {
                if let Some(Operand::Imm(Const::I32(slot))) = instr.args.first() {
                    if *slot == induction_slot {
                        if body_iv.is_some() {
                            return None;
                        }
                        body_iv = instr.dest;
                    }
                }
            }
            Op::Const | Op::Move | Op::LoadArg => {}
            Op::GetElem | Op::SetElem => {
                // Index must be the induction value (unit stride)
                let idx = instr.args.get(1).and_then(|a| a.as_reg());
                if idx != body_iv || body_iv.is_none() {
                    return None;
                }
            }
            Op::BinFloat(_) | Op::Fma => {}
            Op::BinInt(BinOp::Add) => {
                // Only the induction update: iv + 1
                let a0 = instr.args.first().and_then(|a| a.as_reg());
                let a1 = instr.args.get(1).and_then(|a| a.as_imm());
                if a0 != body_iv || a1 != Some(Const::I32(1)) {
                    return None;
                }
                update_reg = instr.dest;
            }
            Op::StoreLocal => {
                let slot = match instr.args.first() {
                    Some(Operand::Imm(Const::I32(s))) => *s,
                    _ => return None,
                };
                if slot != induction_slot
                    || instr.args.get(1).and_then(|a| a.as_reg()) != update_reg
                    || update_reg.is_none()
                {
                    return None;
                }
                updated = true;
            }
            _ => return None, // calls, branches-in-body, anything effectful
        }
    }
    if !updated {
        return None;
    }
    let _ = iv_reg;
    Some(VectorPlan { header, body, induction_slot, bound })
}

fn apply(func: &mut IrFunction, plan: &VectorPlan) {
    let bc = func.block(plan.header).bc_start;

    // Vector header: while (i + lanes <= bound) run the vector body
    let vh = func.add_block(bc);
    let vb = func.add_block(func.block(plan.body).bc_start);

    let iv = func.alloc_reg(JsType::Int32);
    let lanes = func.alloc_reg(JsType::Int32);
    let iv_end = func.alloc_reg(JsType::Int32);
    let cond = func.alloc_reg(JsType::Boolean);
    func.block_mut(vh).instrs = vec![
        Instr { op: Op::Safepoint, dest: None, args: vec![], bc },
        Instr {
            op: Op::LoadLocal,
            dest: Some(iv),
            args: vec![Operand::Imm(Const::I32(plan.induction_slot))],
            bc,
        },
        Instr { op: Op::VecWidth, dest: Some(lanes), args: vec![], bc },
        Instr {
            op: Op::BinInt(BinOp::Add),
            dest: Some(iv_end),
            args: vec![Operand::Reg(iv), Operand::Reg(lanes)],
            bc,
        },
        Instr {
            op: Op::CmpInt(CmpOp::Le),
            dest: Some(cond),
            args: vec![Operand::Reg(iv_end), plan.bound],
            bc,
        },
    ];
    func.block_mut(vh).term = Terminator::Branch {
        cond: Operand::Reg(cond),
        then_block: vb,
        else_block: plan.header,
    };

    // Vector body: clone with fresh registers, lane ops widened, induction
    // advanced by the lane count.
    let mut reg_map: FxHashMap<VReg, VReg> = FxHashMap::default();
    let src_instrs = func.block(plan.body).instrs.clone();
    let mut out: Vec<Instr> = Vec::new();
    let vb_lanes = func.alloc_reg(JsType::Int32);
    out.push(Instr { op: Op::VecWidth, dest: Some(vb_lanes), args: vec![], bc });
    for instr in src_instrs {
        let mut cloned = instr.clone();
        if let Some(d) = cloned.dest {
            let ty = func.reg_type(d);
            let nd = func.alloc_reg(ty);
            reg_map.insert(d, nd);
            cloned.dest = Some(nd);
        }
        for arg in &mut cloned.args {
            if let Operand::Reg(r) = arg {
                if let Some(&nr) = reg_map.get(r) {
                    *arg = Operand::Reg(nr);
                }
            }
        }
        cloned.op = match cloned.op {
            Op::GetElem => Op::VecLoad,
            Op::SetElem => Op::VecStore,
            Op::BinFloat(b) => Op::VecBin(b),
            Op::Fma => Op::VecFma,
            Op::BinInt(BinOp::Add) => {
                // The induction update advances by the vector width
                cloned.args[1] = Operand::Reg(vb_lanes);
                Op::BinInt(BinOp::Add)
            }
            other => other,
        };
        out.push(cloned);
    }
    func.block_mut(vb).instrs = out;
    func.block_mut(vb).term = Terminator::Jump(vh);

    // Outside edges into the scalar header now enter through the vector
    // header; the scalar loop remains as the epilogue for the tail.
    let outside_preds: Vec<BlockId> = func
        .block(plan.header)
        .preds
        .iter()
        .copied()
        .filter(|&p| p != plan.body && p != vb)
        .collect();
    for p in outside_preds {
        match &mut func.block_mut(p).term {
            Terminator::Jump(t) => {
                if *t == plan.header {
                    *t = vh;
                }
            }
            Terminator::Branch { then_block, else_block, .. } => {
                if *then_block == plan.header {
                    *then_block = vh;
                }
                if *else_block == plan.header {
                    *else_block = vh;
                }
            }
            _ => {}
        }
    }
    func.recompute_preds();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TargetArch;

    /// for (i = 0; i < n; i++) dst[i] = a[i] * b[i] + c[i]
    fn triad_loop() -> IrFunction {
        let mut f = IrFunction::new(0, 5, 1);
        let entry = f.add_block(0);
        let header = f.add_block(1);
        let body = f.add_block(2);
        let exit = f.add_block(3);

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
        let c = f.alloc_reg(JsType::Boolean);
        f.block_mut(header).instrs = vec![
            Instr {
                op: Op::LoadLocal,
                dest: Some(i),
                args: vec![Operand::Imm(Const::I32(0))],
                bc: 1,
            },
            Instr {
                op: Op::CmpInt(CmpOp::Lt),
                dest: Some(c),
                args: vec![Operand::Reg(i), Operand::Reg(n)],
                bc: 2,
            },
        ];
        f.block_mut(header).term =
            Terminator::Branch { cond: Operand::Reg(c), then_block: body, else_block: exit };

        let bi = f.alloc_reg(JsType::Int32);
        let a_arr = f.alloc_reg(JsType::Array);
        let b_arr = f.alloc_reg(JsType::Array);
        let c_arr = f.alloc_reg(JsType::Array);
        let d_arr = f.alloc_reg(JsType::Array);
        let av = f.alloc_reg(JsType::Float64);
        let bv = f.alloc_reg(JsType::Float64);
        let cv = f.alloc_reg(JsType::Float64);
        let fv = f.alloc_reg(JsType::Float64);
        let inc = f.alloc_reg(JsType::Int32);
        f.block_mut(body).instrs = vec![
            Instr { op: Op::LoadLocal, dest: Some(bi), args: vec![Operand::Imm(Const::I32(0))], bc: 3 },
            Instr { op: Op::LoadArg, dest: Some(a_arr), args: vec![Operand::Imm(Const::I32(0))], bc: 3 },
            Instr { op: Op::LoadArg, dest: Some(b_arr), args: vec![Operand::Imm(Const::I32(1))], bc: 3 },
            Instr { op: Op::LoadArg, dest: Some(c_arr), args: vec![Operand::Imm(Const::I32(2))], bc: 3 },
            Instr { op: Op::LoadArg, dest: Some(d_arr), args: vec![Operand::Imm(Const::I32(3))], bc: 3 },
            Instr {
                op: Op::GetElem,
                dest: Some(av),
                args: vec![Operand::Reg(a_arr), Operand::Reg(bi)],
                bc: 4,
            },
            Instr {
                op: Op::GetElem,
                dest: Some(bv),
                args: vec![Operand::Reg(b_arr), Operand::Reg(bi)],
                bc: 5,
            },
            Instr {
                op: Op::GetElem,
                dest: Some(cv),
                args: vec![Operand::Reg(c_arr), Operand::Reg(bi)],
                bc: 6,
            },
            Instr {
                op: Op::Fma,
                dest: Some(fv),
                args: vec![Operand::Reg(av), Operand::Reg(bv), Operand::Reg(cv)],
                bc: 7,
            },
            Instr {
                op: Op::SetElem,
                dest: None,
                args: vec![Operand::Reg(d_arr), Operand::Reg(bi), Operand::Reg(fv)],
                bc: 8,
            },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(inc),
                args: vec![Operand::Reg(bi), Operand::Imm(Const::I32(1))],
                bc: 9,
            },
            Instr {
                op: Op::StoreLocal,
                dest: None,
                args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(inc)],
                bc: 10,
            },
        ];
        f.block_mut(body).term = Terminator::Jump(header);
        f.block_mut(exit).term = Terminator::Return(None);
        f.recompute_preds();
        f
    }

    #[test]
    fn test_triad_loop_vectorizes() {
        let mut f = triad_loop();
        let scalar_blocks = f.blocks.len();
        assert!(Vectorization.run(&mut f, &PassCtx::bare(TargetArch::Riscv64)));
        assert_eq!(f.blocks.len(), scalar_blocks + 2);

        // Vector body contains widened ops
        let vb = f
            .blocks
            .iter()
            .find(|b| b.instrs.iter().any(|i| i.op == Op::VecFma))
            .expect("vector body");
        assert!(vb.instrs.iter().any(|i| matches!(i.op, Op::VecLoad)));
        assert!(vb.instrs.iter().any(|i| matches!(i.op, Op::VecStore)));

        // Scalar loop survives as the epilogue
        assert!(f
            .blocks
            .iter()
            .any(|b| b.instrs.iter().any(|i| i.op == Op::Fma)));

        // Entry routes through the vector header
        let entry_target = match &f.blocks[0].term {
            Terminator::Jump(t) => *t,
            other => panic!("unexpected entry terminator {:?}", other),
        };
        let vh = f.block(entry_target);
        assert!(vh.instrs.iter().any(|i| i.op == Op::VecWidth));
    }

    #[test]
    fn test_loop_with_call_not_vectorized() {
        let mut f = triad_loop();
        // Poison the body with a call
        let body = BlockId(2);
        let r = f.alloc_reg(JsType::Unknown);
        f.block_mut(body).instrs.push(Instr {
            op: Op::Call,
            dest: Some(r),
            args: vec![Operand::Imm(Const::I32(1))],
            bc: 9,
        });
        assert!(!Vectorization.run(&mut f, &PassCtx::bare(TargetArch::Riscv64)));
    }

    #[test]
    fn test_non_unit_stride_not_vectorized() {
        let mut f = triad_loop();
        // Rewrite one element access to use a computed (non-induction) index
        let body = BlockId(2);
        let bad = f.alloc_reg(JsType::Int32);
        let block = f.block_mut(body);
        block.instrs.insert(
            5,
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(bad),
                args: vec![Operand::Reg(VReg(2)), Operand::Imm(Const::I32(2))],
                bc: 4,
            },
        );
        assert!(!Vectorization.run(&mut f, &PassCtx::bare(TargetArch::Riscv64)));
    }
}
