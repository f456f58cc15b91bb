//! Constant folding
//!
//! Evaluates instructions whose operands are all constants, with JavaScript
//! semantics: int32 arithmetic wraps in two's complement, integer division by
//! zero produces ±Infinity / NaN, modulo by zero produces NaN, and shift
//! amounts are masked to the low five bits. Constants propagate through Move.

use rustc_hash::FxHashMap;

use crate::ir::instr::{BinOp, CmpOp, Const, IrFunction, Op, Operand, VReg};
use crate::value::f64_to_int32;

use super::{Pass, PassCtx};

/// The folding pass.
pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "const-fold"
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassCtx) -> bool {
        let mut changed = false;

        // Known constant per register, accumulated function-wide: SSA gives
        // each register a single definition, so the map never goes stale.
        let mut known: FxHashMap<VReg, Const> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if instr.op == Op::Const {
                    if let (Some(d), Some(Operand::Imm(c))) = (instr.dest, instr.args.first()) {
                        known.insert(d, *c);
                    }
                }
            }
        }

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                // Replace register operands already known constant
                for arg in &mut instr.args {
                    if let Operand::Reg(r) = arg {
                        if let Some(&c) = known.get(r) {
                            if instr.op != Op::Phi {
                                *arg = Operand::Imm(c);
                                changed = true;
                            }
                        }
                    }
                }

                let folded = fold_instr(instr.op, &instr.args);
                if let (Some(c), Some(dest)) = (folded, instr.dest) {
                    if instr.op != Op::Const {
                        instr.op = Op::Const;
                        instr.args = vec![Operand::Imm(c)];
                        known.insert(dest, c);
                        func.reg_types.insert(dest, c.ty());
                        changed = true;
                    }
                } else if instr.op == Op::Move {
                    // Move from a constant becomes a constant definition
                    if let Some(Operand::Imm(c)) = instr.args.first().copied() {
                        instr.op = Op::Const;
                        if let Some(d) = instr.dest {
                            known.insert(d, c);
                            func.reg_types.insert(d, c.ty());
                        }
                        changed = true;
                    }
                }
            }

            // Constant branch conditions collapse to jumps
            if let crate::ir::instr::Terminator::Branch { cond, then_block, else_block } =
                &block.term
            {
                let c = match cond {
                    Operand::Imm(c) => Some(*c),
                    Operand::Reg(r) => known.get(r).copied(),
                    Operand::Block(_) => None,
                };
                if let Some(taken) = c.and_then(const_truthiness) {
                    let target = if taken { *then_block } else { *else_block };
                    block.term = crate::ir::instr::Terminator::Jump(target);
                    changed = true;
                }
            }
        }

        if changed {
            func.recompute_preds();
        }
        changed
    }
}

/// Truthiness of a constant, when the pass can know it. A string constant is
/// only a table index here; the empty string is falsy, so string truthiness
/// stays with the runtime.
fn const_truthiness(c: Const) -> Option<bool> {
    match c {
        Const::Undefined | Const::Null => Some(false),
        Const::Bool(b) => Some(b),
        Const::I32(v) => Some(v != 0),
        Const::F64(v) => Some(v != 0.0 && !v.is_nan()),
        Const::Str(_) => None,
    }
}

fn as_f64(c: Const) -> Option<f64> {
    match c {
        Const::I32(v) => Some(v as f64),
        Const::F64(v) => Some(v),
        Const::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Const::Null => Some(0.0),
        Const::Undefined => Some(f64::NAN),
        Const::Str(_) => None,
    }
}

fn as_i32(c: Const) -> Option<i32> {
    match c {
        Const::I32(v) => Some(v),
        Const::F64(v) => Some(f64_to_int32(v)),
        Const::Bool(b) => Some(b as i32),
        _ => None,
    }
}

/// Number result, re-narrowed to I32 when exact.
fn num_const(v: f64) -> Const {
    if v.fract() == 0.0
        && v >= i32::MIN as f64
        && v <= i32::MAX as f64
        && !(v == 0.0 && v.is_sign_negative())
    {
        Const::I32(v as i32)
    } else {
        Const::F64(v)
    }
}

/// Evaluate one operation over constant operands.
fn fold_instr(op: Op, args: &[Operand]) -> Option<Const> {
    let imm = |i: usize| args.get(i).and_then(|a| a.as_imm());
    match op {
        Op::Bin(b) | Op::BinInt(b) | Op::BinFloat(b) => {
            let (l, r) = (imm(0)?, imm(1)?);
            fold_bin(op, b, l, r)
        }
        Op::Neg | Op::NegFloat => {
            let v = as_f64(imm(0)?)?;
            Some(num_const(-v))
        }
        Op::NegInt => {
            let v = as_i32(imm(0)?)?;
            Some(Const::I32(v.wrapping_neg()))
        }
        Op::BitNot => {
            let v = as_i32(imm(0)?)?;
            Some(Const::I32(!v))
        }
        Op::Not => Some(Const::Bool(!const_truthiness(imm(0)?)?)),
        Op::Cmp(c) | Op::CmpInt(c) | Op::CmpFloat(c) => {
            let (l, r) = (as_f64(imm(0)?)?, as_f64(imm(1)?)?);
            Some(Const::Bool(fold_cmp(c, l, r)?))
        }
        Op::ToNumber => Some(num_const(as_f64(imm(0)?)?)),
        Op::ToBoolean => Some(Const::Bool(const_truthiness(imm(0)?)?)),
        Op::ToInt32 => Some(Const::I32(as_i32(imm(0)?)?)),
        Op::Int32ToDouble => match imm(0)? {
            Const::I32(v) => Some(Const::F64(v as f64)),
            _ => None,
        },
        Op::DoubleToInt32 => match imm(0)? {
            Const::F64(v) => Some(Const::I32(f64_to_int32(v))),
            Const::I32(v) => Some(Const::I32(v)),
            _ => None,
        },
        _ => None,
    }
}

fn fold_bin(op: Op, bin: BinOp, l: Const, r: Const) -> Option<Const> {
    // Int-specialized forms wrap in two's complement
    if let Op::BinInt(_) = op {
        let (x, y) = (as_i32(l)?, as_i32(r)?);
        return Some(match bin {
            BinOp::Add => Const::I32(x.wrapping_add(y)),
            BinOp::Sub => Const::I32(x.wrapping_sub(y)),
            BinOp::Mul => Const::I32(x.wrapping_mul(y)),
            // Integer division by zero lowers to the IEEE result
            BinOp::Div => {
                if y == 0 {
                    Const::F64(x as f64 / y as f64)
                } else if x % y == 0 {
                    Const::I32(x.wrapping_div(y))
                } else {
                    Const::F64(x as f64 / y as f64)
                }
            }
            BinOp::Mod => {
                if y == 0 {
                    Const::F64(f64::NAN)
                } else {
                    num_const((x as f64) % (y as f64))
                }
            }
            BinOp::BitAnd => Const::I32(x & y),
            BinOp::BitOr => Const::I32(x | y),
            BinOp::BitXor => Const::I32(x ^ y),
            BinOp::Shl => Const::I32(x.wrapping_shl(y as u32 & 31)),
            BinOp::Shr => Const::I32(x.wrapping_shr(y as u32 & 31)),
            BinOp::Ushr => num_const(((x as u32).wrapping_shr(y as u32 & 31)) as f64),
        });
    }

    // Generic and float forms evaluate as doubles; string-typed operands are
    // left for the runtime (concat needs the string table).
    let (x, y) = (as_f64(l)?, as_f64(r)?);
    Some(match bin {
        BinOp::Add => num_const(x + y),
        BinOp::Sub => num_const(x - y),
        BinOp::Mul => num_const(x * y),
        BinOp::Div => num_const(x / y),
        BinOp::Mod => num_const(x % y),
        BinOp::BitAnd => Const::I32(f64_to_int32(x) & f64_to_int32(y)),
        BinOp::BitOr => Const::I32(f64_to_int32(x) | f64_to_int32(y)),
        BinOp::BitXor => Const::I32(f64_to_int32(x) ^ f64_to_int32(y)),
        BinOp::Shl => Const::I32(f64_to_int32(x).wrapping_shl(f64_to_int32(y) as u32 & 31)),
        BinOp::Shr => Const::I32(f64_to_int32(x).wrapping_shr(f64_to_int32(y) as u32 & 31)),
        BinOp::Ushr => {
            num_const(((f64_to_int32(x) as u32).wrapping_shr(f64_to_int32(y) as u32 & 31)) as f64)
        }
    })
}

fn fold_cmp(c: CmpOp, l: f64, r: f64) -> Option<bool> {
    Some(match c {
        CmpOp::Eq | CmpOp::StrictEq => l == r,
        CmpOp::Ne | CmpOp::StrictNe => l != r,
        CmpOp::Lt => l < r,
        CmpOp::Le => l <= r,
        CmpOp::Gt => l > r,
        CmpOp::Ge => l >= r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TargetArch;
    use crate::ir::instr::{Instr, Terminator};
    use crate::ir::types::JsType;

    fn run(f: &mut IrFunction) -> bool {
        ConstantFolding.run(f, &PassCtx::bare(TargetArch::X86_64))
    }

    fn one_block_func(instrs: Vec<Instr>, ret: Option<VReg>) -> IrFunction {
        let mut f = IrFunction::new(0, 0, 0);
        let b = f.add_block(0);
        let max = instrs
            .iter()
            .filter_map(|i| i.dest)
            .map(|r| r.0 + 1)
            .max()
            .unwrap_or(0);
        f.next_reg = max;
        f.block_mut(b).instrs = instrs;
        f.block_mut(b).term = Terminator::Return(ret.map(Operand::Reg));
        f
    }

    fn cinstr(dest: u32, c: Const) -> Instr {
        Instr { op: Op::Const, dest: Some(VReg(dest)), args: vec![Operand::Imm(c)], bc: 0 }
    }

    #[test]
    fn test_int_add_folds() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(5)),
                cinstr(1, Const::I32(10)),
                Instr {
                    op: Op::BinInt(BinOp::Add),
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0)), Operand::Reg(VReg(1))],
                    bc: 2,
                },
            ],
            Some(VReg(2)),
        );
        assert!(run(&mut f));
        let i = &f.blocks[0].instrs[2];
        assert_eq!(i.op, Op::Const);
        assert_eq!(i.args[0].as_imm(), Some(Const::I32(15)));
    }

    #[test]
    fn test_int_overflow_wraps() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(i32::MAX)),
                cinstr(1, Const::I32(1)),
                Instr {
                    op: Op::BinInt(BinOp::Add),
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0)), Operand::Reg(VReg(1))],
                    bc: 2,
                },
            ],
            Some(VReg(2)),
        );
        run(&mut f);
        assert_eq!(f.blocks[0].instrs[2].args[0].as_imm(), Some(Const::I32(i32::MIN)));
    }

    #[test]
    fn test_int_div_by_zero_is_infinity() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(7)),
                cinstr(1, Const::I32(0)),
                Instr {
                    op: Op::BinInt(BinOp::Div),
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0)), Operand::Reg(VReg(1))],
                    bc: 2,
                },
            ],
            Some(VReg(2)),
        );
        run(&mut f);
        assert_eq!(f.blocks[0].instrs[2].args[0].as_imm(), Some(Const::F64(f64::INFINITY)));
    }

    #[test]
    fn test_mod_by_zero_is_nan() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(7)),
                cinstr(1, Const::I32(0)),
                Instr {
                    op: Op::BinInt(BinOp::Mod),
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0)), Operand::Reg(VReg(1))],
                    bc: 2,
                },
            ],
            Some(VReg(2)),
        );
        run(&mut f);
        match f.blocks[0].instrs[2].args[0].as_imm() {
            Some(Const::F64(v)) => assert!(v.is_nan()),
            other => panic!("expected NaN, got {:?}", other),
        }
    }

    #[test]
    fn test_shift_amount_masked() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(1)),
                cinstr(1, Const::I32(33)), // masks to 1
                Instr {
                    op: Op::BinInt(BinOp::Shl),
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0)), Operand::Reg(VReg(1))],
                    bc: 2,
                },
            ],
            Some(VReg(2)),
        );
        run(&mut f);
        assert_eq!(f.blocks[0].instrs[2].args[0].as_imm(), Some(Const::I32(2)));
    }

    #[test]
    fn test_constant_branch_collapses() {
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        f.block_mut(b0).term = Terminator::Branch {
            cond: Operand::Imm(Const::Bool(false)),
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).term = Terminator::Return(None);
        f.block_mut(b2).term = Terminator::Return(None);
        f.recompute_preds();
        assert!(run(&mut f));
        assert_eq!(f.blocks[0].term, Terminator::Jump(b2));
    }

    #[test]
    fn test_string_condition_not_collapsed() {
        // A string constant may be empty (falsy); its truthiness is only
        // known at runtime, so the branch must survive.
        let mut f = IrFunction::new(0, 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        f.block_mut(b0).term = Terminator::Branch {
            cond: Operand::Imm(Const::Str(0)),
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).term = Terminator::Return(None);
        f.block_mut(b2).term = Terminator::Return(None);
        f.recompute_preds();
        assert!(!run(&mut f));
        assert!(matches!(f.blocks[0].term, Terminator::Branch { .. }));
    }

    #[test]
    fn test_string_truthiness_not_folded() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::Str(0)),
                Instr {
                    op: Op::ToBoolean,
                    dest: Some(VReg(1)),
                    args: vec![Operand::Reg(VReg(0))],
                    bc: 1,
                },
                Instr {
                    op: Op::Not,
                    dest: Some(VReg(2)),
                    args: vec![Operand::Reg(VReg(0))],
                    bc: 2,
                },
            ],
            Some(VReg(1)),
        );
        run(&mut f);
        assert_eq!(f.blocks[0].instrs[1].op, Op::ToBoolean);
        assert_eq!(f.blocks[0].instrs[2].op, Op::Not);
    }

    #[test]
    fn test_move_propagates_constant() {
        let mut f = one_block_func(
            vec![
                cinstr(0, Const::I32(9)),
                Instr {
                    op: Op::Move,
                    dest: Some(VReg(1)),
                    args: vec![Operand::Reg(VReg(0))],
                    bc: 1,
                },
            ],
            Some(VReg(1)),
        );
        run(&mut f);
        assert_eq!(f.blocks[0].instrs[1].op, Op::Const);
    }

    #[test]
    fn test_round_trip_conversion_identity() {
        // d2i(i2d(x)) on an int32 constant is the identity
        for x in [0i32, 1, -1, i32::MIN, i32::MAX, 123456] {
            let mut f = one_block_func(
                vec![
                    cinstr(0, Const::I32(x)),
                    Instr {
                        op: Op::Int32ToDouble,
                        dest: Some(VReg(1)),
                        args: vec![Operand::Reg(VReg(0))],
                        bc: 1,
                    },
                    Instr {
                        op: Op::DoubleToInt32,
                        dest: Some(VReg(2)),
                        args: vec![Operand::Reg(VReg(1))],
                        bc: 2,
                    },
                ],
                Some(VReg(2)),
            );
            f.reg_types.insert(VReg(0), JsType::Int32);
            run(&mut f);
            assert_eq!(f.blocks[0].instrs[2].args[0].as_imm(), Some(Const::I32(x)));
        }
    }
}
