//! Loop-invariant code motion
//!
//! For each natural loop, pure instructions whose operands are all defined
//! outside the loop are hoisted to a pre-header inserted in front of the
//! header. Memory reads stay put: a store inside the loop could change what
//! they observe.

use rustc_hash::FxHashSet;

use crate::ir::instr::{BlockId, Instr, IrFunction, Op, Operand, Terminator, VReg};

use super::analysis::natural_loops;
use super::{Pass, PassCtx};

/// The LICM pass.
pub struct LoopInvariantCodeMotion;

impl Pass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let loops = natural_loops(func);
        let mut changed = false;

        for l in loops {
            // Registers defined inside the loop
            let mut defined_in: FxHashSet<VReg> = FxHashSet::default();
            for &bid in &l.body {
                for instr in &func.block(bid).instrs {
                    if let Some(d) = instr.dest {
                        defined_in.insert(d);
                    }
                }
            }

            // Collect hoistable instructions, preserving their order
            let mut hoisted: Vec<Instr> = Vec::new();
            loop {
                let mut moved_any = false;
                for &bid in &l.body {
                    let mut keep: Vec<Instr> = Vec::new();
                    let instrs = std::mem::take(&mut func.block_mut(bid).instrs);
                    for instr in instrs {
                        let hoistable = !instr.op.has_side_effects()
                            && !instr.op.reads_memory()
                            && instr.op != Op::Phi
                            && instr.reg_uses().all(|r| !defined_in.contains(&r));
                        if hoistable {
                            if let Some(d) = instr.dest {
                                defined_in.remove(&d);
                            }
                            hoisted.push(instr);
                            moved_any = true;
                        } else {
                            keep.push(instr);
                        }
                    }
                    func.block_mut(bid).instrs = keep;
                }
                if !moved_any {
                    break;
                }
            }

            if hoisted.is_empty() {
                continue;
            }
            changed = true;

            // Insert the pre-header: entry edges from outside the loop are
            // redirected through it.
            let header = l.header;
            let pre = func.add_block(func.block(header).bc_start);
            func.block_mut(pre).instrs = hoisted;
            func.block_mut(pre).term = Terminator::Jump(header);

            let outside_preds: Vec<BlockId> = func
                .block(header)
                .preds
                .iter()
                .copied()
                .filter(|p| !l.body.contains(p))
                .collect();
            for p in outside_preds {
                redirect(func, p, header, pre);
            }
            // Phi sources naming redirected predecessors move to the pre-header
            for instr in &mut func.block_mut(header).instrs {
                if instr.op == Op::Phi {
                    for arg in &mut instr.args {
                        if let Operand::Block(b) = arg {
                            if !l.body.contains(b) && *b != pre {
                                *arg = Operand::Block(pre);
                            }
                        }
                    }
                }
            }
            func.recompute_preds();
        }
        changed
    }
}

fn redirect(func: &mut IrFunction, from: BlockId, old_to: BlockId, new_to: BlockId) {
    match &mut func.block_mut(from).term {
        Terminator::Jump(t) => {
            if *t == old_to {
                *t = new_to;
            }
        }
        Terminator::Branch { then_block, else_block, .. } => {
            if *then_block == old_to {
                *then_block = new_to;
            }
            if *else_block == old_to {
                *else_block = new_to;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TargetArch;
    use crate::ir::instr::{BinOp, CmpOp, Const};
    use crate::ir::types::JsType;

    /// entry → header { cond } → body { invariant mul; i++ } → header; exit
    fn loop_with_invariant() -> (IrFunction, VReg) {
        let mut f = IrFunction::new(0, 1, 1);
        let entry = f.add_block(0);
        let header = f.add_block(1);
        let body = f.add_block(2);
        let exit = f.add_block(3);

        let a = f.alloc_reg(JsType::Int32); // argument, defined outside
        let cond = f.alloc_reg(JsType::Boolean);
        let inv = f.alloc_reg(JsType::Int32); // a * a: invariant
        let i = f.alloc_reg(JsType::Int32);
        let i2 = f.alloc_reg(JsType::Int32);

        f.block_mut(entry).instrs = vec![Instr {
            op: Op::LoadArg,
            dest: Some(a),
            args: vec![Operand::Imm(Const::I32(0))],
            bc: 0,
        }];
        f.block_mut(entry).term = Terminator::Jump(header);

        f.block_mut(header).instrs = vec![
            Instr { op: Op::LoadLocal, dest: Some(i), args: vec![Operand::Imm(Const::I32(0))], bc: 1 },
            Instr {
                op: Op::CmpInt(CmpOp::Lt),
                dest: Some(cond),
                args: vec![Operand::Reg(i), Operand::Imm(Const::I32(100))],
                bc: 2,
            },
        ];
        f.block_mut(header).term =
            Terminator::Branch { cond: Operand::Reg(cond), then_block: body, else_block: exit };

        f.block_mut(body).instrs = vec![
            Instr {
                op: Op::BinInt(BinOp::Mul),
                dest: Some(inv),
                args: vec![Operand::Reg(a), Operand::Reg(a)],
                bc: 3,
            },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(i2),
                args: vec![Operand::Reg(i), Operand::Imm(Const::I32(1))],
                bc: 4,
            },
            Instr {
                op: Op::StoreLocal,
                dest: None,
                args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(i2)],
                bc: 5,
            },
        ];
        f.block_mut(body).term = Terminator::Jump(header);
        f.block_mut(exit).term = Terminator::Return(Some(Operand::Reg(inv)));
        f.recompute_preds();
        (f, inv)
    }

    #[test]
    fn test_invariant_hoisted_to_preheader() {
        let (mut f, inv) = loop_with_invariant();
        let changed = LoopInvariantCodeMotion.run(&mut f, &PassCtx::bare(TargetArch::X86_64));
        assert!(changed);

        // The multiply left the body
        let body = &f.blocks[2];
        assert!(body
            .instrs
            .iter()
            .all(|i| i.dest != Some(inv)));

        // A new block holds it and jumps to the header
        let pre = f.blocks.iter().find(|b| b.instrs.iter().any(|i| i.dest == Some(inv)));
        let pre = pre.expect("pre-header with hoisted instruction");
        assert_eq!(pre.term, Terminator::Jump(BlockId(1)));

        // Entry now reaches the header through the pre-header
        assert_eq!(f.blocks[0].term, Terminator::Jump(pre.id));
    }

    #[test]
    fn test_loop_varying_not_hoisted() {
        let (mut f, _) = loop_with_invariant();
        LoopInvariantCodeMotion.run(&mut f, &PassCtx::bare(TargetArch::X86_64));
        // The induction update (uses i, defined in the loop) stays in the body
        let body = &f.blocks[2];
        assert!(body.instrs.iter().any(|i| i.op == Op::BinInt(BinOp::Add)));
        assert!(body.instrs.iter().any(|i| i.op == Op::StoreLocal));
    }

    #[test]
    fn test_idempotent_on_clean_loop() {
        let (mut f, _) = loop_with_invariant();
        let ctx = PassCtx::bare(TargetArch::X86_64);
        LoopInvariantCodeMotion.run(&mut f, &ctx);
        assert!(!LoopInvariantCodeMotion.run(&mut f, &ctx));
    }
}
