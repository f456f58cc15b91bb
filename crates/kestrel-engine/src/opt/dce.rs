//! Dead code elimination
//!
//! Two phases: blocks unreachable from entry are emptied out of the CFG, then
//! a liveness walk keeps side-effectful instructions and, transitively,
//! everything defining a value they or the terminators use. The rest is
//! removed.

use rustc_hash::FxHashSet;

use crate::ir::instr::{IrFunction, Op, Terminator, VReg};

use super::analysis::reachable_blocks;
use super::{Pass, PassCtx};

/// The DCE pass.
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let mut changed = false;

        // Phase 1: unreachable blocks are emptied and disconnected.
        let reachable = reachable_blocks(func);
        for block in &mut func.blocks {
            if !reachable.contains(&block.id) && !block.instrs.is_empty() {
                block.instrs.clear();
                block.term = Terminator::Return(None);
                changed = true;
            }
        }

        // Phase 2: liveness. Seed with effectful instructions and terminator
        // uses, then propagate through operands to a fixed point.
        let mut live_regs: FxHashSet<VReg> = FxHashSet::default();
        for &bid in &reachable {
            let block = func.block(bid);
            if let Some(r) = block.term.reg_uses() {
                live_regs.insert(r);
            }
            for instr in &block.instrs {
                if instr.op.has_side_effects() {
                    for r in instr.reg_uses() {
                        live_regs.insert(r);
                    }
                    if let Some(d) = instr.dest {
                        // An effectful instruction's result may itself be dead,
                        // but its operands are not.
                        let _ = d;
                    }
                }
            }
        }

        loop {
            let before = live_regs.len();
            for &bid in &reachable {
                for instr in &func.block(bid).instrs {
                    if let Some(d) = instr.dest {
                        if live_regs.contains(&d) {
                            for r in instr.reg_uses() {
                                live_regs.insert(r);
                            }
                        }
                    }
                }
            }
            if live_regs.len() == before {
                break;
            }
        }

        for block in &mut func.blocks {
            let before = block.instrs.len();
            block.instrs.retain(|instr| {
                if instr.op.has_side_effects() {
                    return true;
                }
                match instr.dest {
                    Some(d) => live_regs.contains(&d),
                    None => false,
                }
            });
            if block.instrs.len() != before {
                changed = true;
            }
        }

        if changed {
            func.recompute_preds();
        }
        changed
    }
}

/// Drop phi instructions whose destination is never used. Phis are pure, so
/// the main retain above already handles them; this helper exists for passes
/// that rewrite phis in place and is exercised by the builder tests.
pub fn prune_dead_phis(func: &mut IrFunction) {
    let mut used: FxHashSet<VReg> = FxHashSet::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            for r in instr.reg_uses() {
                used.insert(r);
            }
        }
        if let Some(r) = block.term.reg_uses() {
            used.insert(r);
        }
    }
    for block in &mut func.blocks {
        block
            .instrs
            .retain(|i| i.op != Op::Phi || i.dest.map(|d| used.contains(&d)).unwrap_or(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TargetArch;
    use crate::ir::instr::{BinOp, Const, Instr, Operand};
    use crate::ir::types::JsType;

    fn run(f: &mut IrFunction) -> bool {
        DeadCodeElimination.run(f, &PassCtx::bare(TargetArch::X86_64))
    }

    #[test]
    fn test_unused_pure_instruction_removed() {
        let mut f = IrFunction::new(0, 0, 0);
        let b = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(1))], bc: 0 },
            Instr { op: Op::Const, dest: Some(v1), args: vec![Operand::Imm(Const::I32(2))], bc: 1 },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(v0)));
        assert!(run(&mut f));
        assert_eq!(f.blocks[0].instrs.len(), 1);
        assert_eq!(f.blocks[0].instrs[0].dest, Some(v0));
    }

    #[test]
    fn test_store_is_kept() {
        let mut f = IrFunction::new(0, 0, 1);
        let b = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(1))], bc: 0 },
            Instr {
                op: Op::StoreLocal,
                dest: None,
                args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(v0)],
                bc: 1,
            },
        ];
        f.block_mut(b).term = Terminator::Return(None);
        run(&mut f);
        // Store and its operand's definition both survive
        assert_eq!(f.blocks[0].instrs.len(), 2);
    }

    #[test]
    fn test_transitive_liveness() {
        let mut f = IrFunction::new(0, 0, 0);
        let b = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        let v2 = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(1))], bc: 0 },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(v1),
                args: vec![Operand::Reg(v0), Operand::Reg(v0)],
                bc: 1,
            },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(v2),
                args: vec![Operand::Reg(v1), Operand::Reg(v1)],
                bc: 2,
            },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(v2)));
        assert!(!run(&mut f)); // everything is live
        assert_eq!(f.blocks[0].instrs.len(), 3);
    }

    #[test]
    fn test_unreachable_block_emptied() {
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let dead = f.add_block(5);
        let v0 = f.alloc_reg(JsType::Int32);
        f.block_mut(b0).term = Terminator::Return(None);
        f.block_mut(dead).instrs = vec![Instr {
            op: Op::Const,
            dest: Some(v0),
            args: vec![Operand::Imm(Const::I32(1))],
            bc: 0,
        }];
        f.block_mut(dead).term = Terminator::Return(Some(Operand::Reg(v0)));
        assert!(run(&mut f));
        assert!(f.blocks[1].instrs.is_empty());
    }
}
