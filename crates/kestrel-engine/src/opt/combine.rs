//! Instruction combining
//!
//! Pattern selection ahead of the backends: a float multiply feeding a
//! single-use add fuses into `Fma`, and an element access whose index is a
//! register-plus-constant collapses into the offset addressing form.

use rustc_hash::FxHashMap;

use crate::ir::instr::{BinOp, Const, IrFunction, Op, Operand, VReg};

use super::{Pass, PassCtx};

/// The combining pass.
pub struct InstructionCombining;

impl Pass for InstructionCombining {
    fn name(&self) -> &'static str {
        "combine"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let mut changed = false;

        // Use counts across the function (single-use products are fusable)
        let mut use_counts: FxHashMap<VReg, u32> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                for r in instr.reg_uses() {
                    *use_counts.entry(r).or_insert(0) += 1;
                }
            }
            if let Some(r) = block.term.reg_uses() {
                *use_counts.entry(r).or_insert(0) += 1;
            }
        }

        for block in &mut func.blocks {
            // Products defined earlier in this block: dest → (lhs, rhs)
            let mut products: FxHashMap<VReg, (Operand, Operand)> = FxHashMap::default();
            // Int add-with-constant: dest → (base, offset)
            let mut offset_adds: FxHashMap<VReg, (Operand, i32)> = FxHashMap::default();

            for instr in &mut block.instrs {
                match instr.op {
                    Op::BinFloat(BinOp::Mul) => {
                        if let Some(d) = instr.dest {
                            products.insert(d, (instr.args[0], instr.args[1]));
                        }
                    }
                    Op::BinInt(BinOp::Add) => {
                        if let Some(d) = instr.dest {
                            match (instr.args[0], instr.args[1]) {
                                (base, Operand::Imm(Const::I32(k)))
                                | (Operand::Imm(Const::I32(k)), base) => {
                                    offset_adds.insert(d, (base, k));
                                }
                                _ => {}
                            }
                        }
                    }
                    // Mul feeding Add (either side) → FMA when the product has
                    // exactly this one use
                    Op::BinFloat(BinOp::Add) => {
                        let fused = match (instr.args[0], instr.args[1]) {
                            (Operand::Reg(p), addend) | (addend, Operand::Reg(p)) => products
                                .get(&p)
                                .filter(|_| use_counts.get(&p) == Some(&1))
                                .map(|&(a, b)| (a, b, addend)),
                            _ => None,
                        };
                        if let Some((a, b, c)) = fused {
                            instr.op = Op::Fma;
                            instr.args = vec![a, b, c];
                            changed = true;
                        }
                    }
                    // GetElem with a reg+const index → offset addressing
                    Op::GetElem => {
                        if let Some(Operand::Reg(idx)) = instr.args.get(1).copied() {
                            if let Some(&(base, k)) = offset_adds.get(&idx) {
                                if use_counts.get(&idx) == Some(&1) {
                                    instr.op = Op::GetElemOffset;
                                    instr.args =
                                        vec![instr.args[0], base, Operand::Imm(Const::I32(k))];
                                    changed = true;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        changed
    }
}
