//! Common subexpression elimination
//!
//! Hash-conses side-effect-free expressions by `(opcode, operands)`. Within a
//! basic block, memory loads participate until an intervening write; across
//! blocks, only non-memory expressions are reused, scoped by dominance (a
//! child block in the dominator tree inherits its parent's available set).

use rustc_hash::FxHashMap;

use crate::ir::instr::{BlockId, Const, IrFunction, Op, Operand, VReg};

use super::analysis::{dominators, reverse_postorder};
use super::{Pass, PassCtx};

/// Hashable key for an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExprKey {
    op: Op,
    args: Vec<(u8, u64)>,
}

fn operand_key(a: Operand) -> (u8, u64) {
    match a {
        Operand::Reg(VReg(r)) => (0, r as u64),
        Operand::Block(BlockId(b)) => (1, b as u64),
        Operand::Imm(c) => match c {
            Const::Undefined => (2, 0),
            Const::Null => (3, 0),
            Const::Bool(b) => (4, b as u64),
            Const::I32(v) => (5, v as u32 as u64),
            Const::F64(v) => (6, v.to_bits()),
            Const::Str(i) => (7, i as u64),
        },
    }
}

fn expr_key(op: Op, args: &[Operand]) -> ExprKey {
    ExprKey { op, args: args.iter().map(|&a| operand_key(a)).collect() }
}

/// Whether an op is eligible for hash-consing at all.
fn is_cse_candidate(op: Op) -> bool {
    !op.has_side_effects() && !matches!(op, Op::Phi | Op::Const | Op::Move | Op::VecWidth)
}

/// Whether an instruction invalidates memory-dependent expressions.
fn clobbers_memory(op: Op) -> bool {
    matches!(
        op,
        Op::Call
            | Op::SetProp
            | Op::SetElem
            | Op::DelProp
            | Op::DelElem
            | Op::StoreLocal
            | Op::StoreArg
            | Op::StoreGlobal
            | Op::VecStore
            | Op::NewObject
            | Op::NewArray
    )
}

/// The CSE pass.
pub struct CommonSubexpressionElimination;

impl Pass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let mut changed = false;
        let idom = dominators(func);
        let rpo = reverse_postorder(func);

        // Available pure (non-memory) expressions at the end of each block,
        // inherited down the dominator tree.
        let mut avail_out: FxHashMap<BlockId, FxHashMap<ExprKey, VReg>> = FxHashMap::default();

        for &bid in &rpo {
            // Start from the immediate dominator's set (entry starts empty).
            let mut avail: FxHashMap<ExprKey, VReg> = idom
                .get(&bid)
                .filter(|&&d| d != bid)
                .and_then(|d| avail_out.get(d))
                .cloned()
                .unwrap_or_default();
            // Block-local memory expressions, cleared at clobbers.
            let mut mem_avail: FxHashMap<ExprKey, VReg> = FxHashMap::default();

            let block = func.block_mut(bid);
            for instr in &mut block.instrs {
                if clobbers_memory(instr.op) {
                    mem_avail.clear();
                }
                if !is_cse_candidate(instr.op) {
                    continue;
                }
                let dest = match instr.dest {
                    Some(d) => d,
                    None => continue,
                };
                let key = expr_key(instr.op, &instr.args);
                let table = if instr.op.reads_memory() { &mut mem_avail } else { &mut avail };
                match table.get(&key) {
                    Some(&prev) => {
                        instr.op = Op::Move;
                        instr.args = vec![Operand::Reg(prev)];
                        changed = true;
                    }
                    None => {
                        table.insert(key, dest);
                    }
                }
            }
            avail_out.insert(bid, avail);
        }
        changed
    }
}
