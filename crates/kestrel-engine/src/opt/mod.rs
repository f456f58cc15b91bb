//! IR optimization pipeline
//!
//! Each pass implements [`Pass`] and reports whether it changed the function;
//! the driver iterates the level's pass set to a fixed point (bounded by a
//! pass budget), then runs the one-shot lowering passes (vectorization and
//! scheduling) that are not part of the fixed-point set.

pub mod analysis;
pub mod combine;
pub mod const_fold;
pub mod cse;
pub mod dce;
pub mod licm;
pub mod schedule;
pub mod specialize;
pub mod vectorize;

use std::sync::Arc;

use crate::backend::TargetArch;
use crate::ir::instr::IrFunction;
use crate::profiler::FunctionProfile;

/// Iterations of the fixed-point loop before the driver gives up.
const PASS_BUDGET: usize = 8;

/// Optimization level, chosen per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// No IR rewriting (baseline): lower as built
    None,
    /// Folding and cleanup only
    Canonicalize,
    /// The medium set: fold, DCE, CSE, specialize, LICM
    Medium,
    /// Everything, including combining, vectorization, and scheduling
    Full,
}

/// Pre-interned string-table indices the optimizer needs (typeof results).
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnownStrings {
    /// "undefined"
    pub undefined_: u32,
    /// "object"
    pub object_: u32,
    /// "boolean"
    pub boolean_: u32,
    /// "number"
    pub number_: u32,
    /// "string"
    pub string_: u32,
    /// "function"
    pub function_: u32,
}

/// Shared input to every pass.
pub struct PassCtx {
    /// Profiler feedback for the function being compiled, if any
    pub feedback: Option<Arc<FunctionProfile>>,
    /// Minimum stability required before a speculation is planted
    pub stability_threshold: f64,
    /// Target the code will be emitted for (latencies, vector width)
    pub target: TargetArch,
    /// Interned typeof-result strings
    pub strings: WellKnownStrings,
}

impl PassCtx {
    /// Context with no feedback, for tests and ahead-of-time pipelines.
    pub fn bare(target: TargetArch) -> Self {
        PassCtx {
            feedback: None,
            stability_threshold: 0.8,
            target,
            strings: WellKnownStrings::default(),
        }
    }
}

/// An optimization pass over an IR function.
pub trait Pass: Send + Sync {
    /// Pass name for diagnostics.
    fn name(&self) -> &'static str;
    /// Run the pass; returns true when the function changed.
    fn run(&self, func: &mut IrFunction, ctx: &PassCtx) -> bool;
}

/// The pass pipeline for one optimization level.
pub struct Pipeline {
    level: OptLevel,
    fixed_point: Vec<Box<dyn Pass>>,
    finishing: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    /// Build the pipeline for a level.
    pub fn for_level(level: OptLevel) -> Self {
        let mut fixed_point: Vec<Box<dyn Pass>> = Vec::new();
        let mut finishing: Vec<Box<dyn Pass>> = Vec::new();
        if level >= OptLevel::Canonicalize {
            fixed_point.push(Box::new(const_fold::ConstantFolding));
            fixed_point.push(Box::new(dce::DeadCodeElimination));
        }
        if level >= OptLevel::Medium {
            fixed_point.push(Box::new(cse::CommonSubexpressionElimination));
            fixed_point.push(Box::new(specialize::TypeSpecialization));
            fixed_point.push(Box::new(licm::LoopInvariantCodeMotion));
        }
        if level >= OptLevel::Full {
            fixed_point.push(Box::new(combine::InstructionCombining));
            finishing.push(Box::new(vectorize::Vectorization));
            finishing.push(Box::new(schedule::InstructionScheduling));
        }
        Pipeline { level, fixed_point, finishing }
    }

    /// The level this pipeline was built for.
    pub fn level(&self) -> OptLevel {
        self.level
    }

    /// Run the pipeline to fixed point, then the finishing passes.
    pub fn optimize(&self, func: &mut IrFunction, ctx: &PassCtx) {
        for _ in 0..PASS_BUDGET {
            let mut changed = false;
            for pass in &self.fixed_point {
                changed |= pass.run(func, ctx);
            }
            if !changed {
                break;
            }
        }
        for pass in &self.finishing {
            pass.run(func, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::{BinOp, Const, Instr, Op, Operand, Terminator};
    use crate::ir::types::JsType;

    #[test]
    fn test_pipeline_levels() {
        assert!(Pipeline::for_level(OptLevel::None).fixed_point.is_empty());
        assert!(!Pipeline::for_level(OptLevel::Canonicalize).fixed_point.is_empty());
        assert!(!Pipeline::for_level(OptLevel::Full).finishing.is_empty());
    }

    #[test]
    fn test_fold_then_dce_end_to_end() {
        // const 5; const 10; add; ret  →  ret 15i
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        let v2 = f.alloc_reg(JsType::Int32);
        f.block_mut(b0).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(5))], bc: 0 },
            Instr { op: Op::Const, dest: Some(v1), args: vec![Operand::Imm(Const::I32(10))], bc: 1 },
            Instr {
                op: Op::BinInt(BinOp::Add),
                dest: Some(v2),
                args: vec![Operand::Reg(v0), Operand::Reg(v1)],
                bc: 2,
            },
        ];
        f.block_mut(b0).term = Terminator::Return(Some(Operand::Reg(v2)));

        let pipeline = Pipeline::for_level(OptLevel::Canonicalize);
        pipeline.optimize(&mut f, &PassCtx::bare(TargetArch::X86_64));

        // A single constant definition feeds the return
        let b = &f.blocks[0];
        assert_eq!(b.instrs.len(), 1);
        assert_eq!(b.instrs[0].op, Op::Const);
        assert_eq!(b.instrs[0].args[0].as_imm(), Some(Const::I32(15)));
    }

    #[test]
    fn test_folding_is_idempotent() {
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Int32);
        let v2 = f.alloc_reg(JsType::Int32);
        f.block_mut(b0).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(2))], bc: 0 },
            Instr { op: Op::Const, dest: Some(v1), args: vec![Operand::Imm(Const::I32(3))], bc: 1 },
            Instr {
                op: Op::BinInt(BinOp::Mul),
                dest: Some(v2),
                args: vec![Operand::Reg(v0), Operand::Reg(v1)],
                bc: 2,
            },
        ];
        f.block_mut(b0).term = Terminator::Return(Some(Operand::Reg(v2)));

        let ctx = PassCtx::bare(TargetArch::X86_64);
        const_fold::ConstantFolding.run(&mut f, &ctx);
        let after_once = format!("{}", f);
        const_fold::ConstantFolding.run(&mut f, &ctx);
        assert_eq!(after_once, format!("{}", f));
    }
}
