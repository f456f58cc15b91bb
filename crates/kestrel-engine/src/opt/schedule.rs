//! Instruction scheduling
//!
//! Per-block list scheduling: build the dependency graph (register RAW,
//! conservative memory ordering, a chain through side effects), weight each
//! node by the longest latency path to a sink, then emit ready nodes highest
//! priority first, breaking ties by original order. Phis stay pinned at the
//! block head.

use rustc_hash::FxHashMap;

use crate::backend::TargetArch;
use crate::ir::instr::{Instr, IrFunction, Op, VReg};

use super::{Pass, PassCtx};

/// Per-target instruction latencies in cycles.
pub struct LatencyTable {
    arch: TargetArch,
}

impl LatencyTable {
    /// The table for a target.
    pub fn for_target(arch: TargetArch) -> Self {
        LatencyTable { arch }
    }

    /// Estimated latency of one operation.
    pub fn latency(&self, op: Op) -> u32 {
        // Baseline costs; the multiply/divide spreads differ per ISA.
        let (mul, div, fma, mem) = match self.arch {
            TargetArch::X86_64 => (3, 22, 4, 5),
            TargetArch::Aarch64 => (3, 12, 4, 4),
            TargetArch::Riscv64 => (4, 30, 5, 4),
        };
        match op {
            Op::Const | Op::Move | Op::Phi | Op::VecWidth => 1,
            Op::BinInt(b) | Op::VecBin(b) | Op::Bin(b) | Op::BinFloat(b) => {
                use crate::ir::instr::BinOp::*;
                match b {
                    Mul => mul,
                    Div | Mod => div,
                    _ => 1,
                }
            }
            Op::Fma | Op::VecFma => fma,
            Op::LoadLocal | Op::LoadArg | Op::LoadGlobal | Op::GetElem | Op::GetElemOffset
            | Op::VecLoad => mem,
            Op::StoreLocal | Op::StoreArg | Op::StoreGlobal | Op::SetElem | Op::VecStore => mem,
            Op::GetProp | Op::SetProp | Op::Call | Op::NewObject | Op::NewArray => 20,
            _ => 2,
        }
    }
}

/// The scheduling pass.
pub struct InstructionScheduling;

impl Pass for InstructionScheduling {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn run(&self, func: &mut IrFunction, ctx: &PassCtx) -> bool {
        let latencies = LatencyTable::for_target(ctx.target);
        let mut changed = false;
        for block in &mut func.blocks {
            changed |= schedule_block(&mut block.instrs, &latencies);
        }
        changed
    }
}

fn schedule_block(instrs: &mut Vec<Instr>, latencies: &LatencyTable) -> bool {
    // Phis (and nothing else) must stay at the head.
    let pinned = instrs.iter().take_while(|i| i.op == Op::Phi).count();
    let body: Vec<Instr> = instrs[pinned..].to_vec();
    let n = body.len();
    if n < 2 {
        return false;
    }

    // Dependency edges: succ[i] lists nodes that must run after i.
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut pred_count = vec![0usize; n];
    let mut add_edge = |succs: &mut Vec<Vec<usize>>, pred_count: &mut Vec<usize>, from: usize, to: usize| {
        if from != to && !succs[from].contains(&to) {
            succs[from].push(to);
            pred_count[to] += 1;
        }
    };

    let mut def_at: FxHashMap<VReg, usize> = FxHashMap::default();
    let mut last_effect: Option<usize> = None;
    let mut loads_since_effect: Vec<usize> = Vec::new();

    for (i, instr) in body.iter().enumerate() {
        // Register RAW dependencies
        for r in instr.reg_uses() {
            if let Some(&d) = def_at.get(&r) {
                add_edge(&mut succs, &mut pred_count, d, i);
            }
        }
        if let Some(d) = instr.dest {
            def_at.insert(d, i);
        }

        // Memory and effect ordering: effects form a chain, loads order
        // against the surrounding effects (no aliasing information).
        if instr.op.has_side_effects() {
            if let Some(e) = last_effect {
                add_edge(&mut succs, &mut pred_count, e, i);
            }
            for &l in &loads_since_effect {
                add_edge(&mut succs, &mut pred_count, l, i);
            }
            loads_since_effect.clear();
            last_effect = Some(i);
        } else if instr.op.reads_memory() {
            if let Some(e) = last_effect {
                add_edge(&mut succs, &mut pred_count, e, i);
            }
            loads_since_effect.push(i);
        }
    }

    // Priority: longest latency path from the node to any sink.
    let mut priority = vec![0u32; n];
    for i in (0..n).rev() {
        let own = latencies.latency(body[i].op);
        let best_succ = succs[i].iter().map(|&s| priority[s]).max().unwrap_or(0);
        priority[i] = own + best_succ;
    }

    // List scheduling: ready nodes by (priority desc, original index asc).
    let mut scheduled: Vec<usize> = Vec::with_capacity(n);
    let mut ready: Vec<usize> = (0..n).filter(|&i| pred_count[i] == 0).collect();
    while !ready.is_empty() {
        ready.sort_by(|&a, &b| priority[b].cmp(&priority[a]).then(a.cmp(&b)));
        let next = ready.remove(0);
        scheduled.push(next);
        for &s in &succs[next] {
            pred_count[s] -= 1;
            if pred_count[s] == 0 {
                ready.push(s);
            }
        }
    }
    debug_assert_eq!(scheduled.len(), n);

    let changed = scheduled.iter().enumerate().any(|(pos, &orig)| pos != orig);
    if changed {
        let mut out: Vec<Instr> = instrs[..pinned].to_vec();
        out.extend(scheduled.into_iter().map(|i| body[i].clone()));
        *instrs = out;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::{BinOp, Const, Operand, Terminator};
    use crate::ir::types::JsType;

    #[test]
    fn test_dependencies_preserved() {
        let mut f = IrFunction::new(0, 0, 0);
        let b = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        let v2 = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(1))], bc: 0 },
            Instr {
                op: Op::BinInt(BinOp::Mul),
                dest: Some(v1),
                args: vec![Operand::Reg(v0), Operand::Reg(v0)],
                bc: 1,
            },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(v2),
                args: vec![Operand::Reg(v1), Operand::Reg(v0)],
                bc: 2,
            },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(v2)));

        InstructionScheduling.run(&mut f, &PassCtx::bare(TargetArch::X86_64));

        // Defs still precede uses
        let order: Vec<Option<VReg>> = f.blocks[0].instrs.iter().map(|i| i.dest).collect();
        let pos = |r: VReg| order.iter().position(|&d| d == Some(r)).unwrap();
        assert!(pos(v0) < pos(v1));
        assert!(pos(v1) < pos(v2));
    }

    #[test]
    fn test_stores_keep_program_order() {
        let mut f = IrFunction::new(0, 0, 2);
        let b = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(1))], bc: 0 },
            Instr {
                op: Op::StoreLocal,
                dest: None,
                args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(v0)],
                bc: 1,
            },
            Instr { op: Op::Const, dest: Some(v1), args: vec![Operand::Imm(Const::I32(2))], bc: 2 },
            Instr {
                op: Op::StoreLocal,
                dest: None,
                args: vec![Operand::Imm(Const::I32(0)), Operand::Reg(v1)],
                bc: 3,
            },
        ];
        f.block_mut(b).term = Terminator::Return(None);

        InstructionScheduling.run(&mut f, &PassCtx::bare(TargetArch::Aarch64));

        let stores: Vec<i32> = f.blocks[0]
            .instrs
            .iter()
            .filter(|i| i.op == Op::StoreLocal)
            .map(|i| match i.args[1] {
                Operand::Reg(r) => r.0 as i32,
                _ => -1,
            })
            .collect();
        assert_eq!(stores, vec![v0.0 as i32, v1.0 as i32]);
    }

    #[test]
    fn test_long_latency_hoisted() {
        // An independent multiply should be scheduled before cheap constants
        // that nothing waits on.
        let mut f = IrFunction::new(0, 2, 0);
        let b = f.add_block(0);
        let a0 = f.alloc_reg(JsType::Int32);
        let a1 = f.alloc_reg(JsType::Int32);
        let prod = f.alloc_reg(JsType::Int32);
        let c0 = f.alloc_reg(JsType::Int32);
        let sum = f.alloc_reg(JsType::Int32);
        f.block_mut(b).instrs = vec![
            Instr { op: Op::LoadArg, dest: Some(a0), args: vec![Operand::Imm(Const::I32(0))], bc: 0 },
            Instr { op: Op::LoadArg, dest: Some(a1), args: vec![Operand::Imm(Const::I32(1))], bc: 1 },
            Instr { op: Op::Const, dest: Some(c0), args: vec![Operand::Imm(Const::I32(7))], bc: 2 },
            Instr {
                op: Op::BinInt(BinOp::Mul),
                dest: Some(prod),
                args: vec![Operand::Reg(a0), Operand::Reg(a1)],
                bc: 3,
            },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(sum),
                args: vec![Operand::Reg(prod), Operand::Reg(c0)],
                bc: 4,
            },
        ];
        f.block_mut(b).term = Terminator::Return(Some(Operand::Reg(sum)));

        InstructionScheduling.run(&mut f, &PassCtx::bare(TargetArch::X86_64));
        let instrs = &f.blocks[0].instrs;
        let mul_pos = instrs.iter().position(|i| i.op == Op::BinInt(BinOp::Mul)).unwrap();
        let const_pos = instrs.iter().position(|i| i.op == Op::Const).unwrap();
        assert!(mul_pos < const_pos);
    }
}
