//! Type specialization
//!
//! Forward type inference over the lattice, seeded by constants and the
//! profiler's annotations, then a rewrite: polymorphic arithmetic and
//! comparisons whose operands have a known narrow type become the typed
//! variants (with guards planted on feedback-derived operands), provably
//! idempotent conversions disappear, and `typeof` of a known-type operand
//! folds to its string.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::instr::{BinOp, Const, Instr, IrFunction, Op, Operand, VReg};
use crate::ir::types::JsType;

use super::analysis::reverse_postorder;
use super::{Pass, PassCtx};

/// The specialization pass.
pub struct TypeSpecialization;

impl Pass for TypeSpecialization {
    fn name(&self) -> &'static str {
        "specialize"
    }

    fn run(&self, func: &mut IrFunction, ctx: &PassCtx) -> bool {
        infer_types(func);
        let mut changed = false;

        // Registers whose type is feedback-derived rather than proven need a
        // guard before their first specialized use.
        let hinted: FxHashSet<VReg> = func
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| {
                matches!(i.op, Op::LoadLocal | Op::LoadArg | Op::LoadGlobal | Op::Phi | Op::Call)
            })
            .filter_map(|i| i.dest)
            .filter(|d| func.reg_type(*d) != JsType::Mixed && func.reg_type(*d) != JsType::Unknown)
            .collect();
        let mut guarded: FxHashSet<VReg> = FxHashSet::default();

        for bi in 0..func.blocks.len() {
            let mut rewritten: Vec<Instr> = Vec::new();
            let instrs = std::mem::take(&mut func.blocks[bi].instrs);
            for mut instr in instrs {
                let op_ty = |operand: &Operand, f: &IrFunction| -> JsType {
                    match operand {
                        Operand::Reg(r) => f.reg_type(*r),
                        Operand::Imm(c) => c.ty(),
                        Operand::Block(_) => JsType::Unknown,
                    }
                };

                match instr.op {
                    Op::Bin(b) => {
                        let lt = op_ty(&instr.args[0], func);
                        let rt = op_ty(&instr.args[1], func);
                        if lt == JsType::Int32 && rt == JsType::Int32 && int_safe(b) {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardInt, &mut rewritten);
                            instr.op = Op::BinInt(b);
                            if let Some(d) = instr.dest {
                                func.reg_types.insert(d, result_type_int(b));
                            }
                            changed = true;
                        } else if lt.is_numeric() && rt.is_numeric() && float_safe(b) {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardFloat, &mut rewritten);
                            instr.op = Op::BinFloat(b);
                            if let Some(d) = instr.dest {
                                func.reg_types.insert(d, JsType::Float64);
                            }
                            changed = true;
                        } else if b == BinOp::Add && lt == JsType::String && rt == JsType::String {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardString, &mut rewritten);
                            instr.op = Op::ConcatStr;
                            if let Some(d) = instr.dest {
                                func.reg_types.insert(d, JsType::String);
                            }
                            changed = true;
                        }
                    }
                    Op::Cmp(c) => {
                        let lt = op_ty(&instr.args[0], func);
                        let rt = op_ty(&instr.args[1], func);
                        if lt == JsType::Int32 && rt == JsType::Int32 {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardInt, &mut rewritten);
                            instr.op = Op::CmpInt(c);
                            changed = true;
                        } else if lt.is_numeric() && rt.is_numeric() {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardFloat, &mut rewritten);
                            instr.op = Op::CmpFloat(c);
                            changed = true;
                        } else if lt == JsType::String && rt == JsType::String {
                            plant_guards(&instr, &hinted, &mut guarded, Op::GuardString, &mut rewritten);
                            instr.op = Op::CmpStr(c);
                            changed = true;
                        }
                    }
                    Op::Neg => {
                        let t = op_ty(&instr.args[0], func);
                        if t == JsType::Int32 {
                            instr.op = Op::NegInt;
                            changed = true;
                        } else if t == JsType::Float64 {
                            instr.op = Op::NegFloat;
                            changed = true;
                        }
                    }
                    // Idempotent conversions vanish
                    Op::ToNumber => {
                        let t = op_ty(&instr.args[0], func);
                        if t.is_numeric() {
                            instr.op = Op::Move;
                            changed = true;
                        }
                    }
                    Op::ToString => {
                        if op_ty(&instr.args[0], func) == JsType::String {
                            instr.op = Op::Move;
                            changed = true;
                        }
                    }
                    Op::ToBoolean => {
                        if op_ty(&instr.args[0], func) == JsType::Boolean {
                            instr.op = Op::Move;
                            changed = true;
                        }
                    }
                    Op::ToInt32 => {
                        if op_ty(&instr.args[0], func) == JsType::Int32 {
                            instr.op = Op::Move;
                            changed = true;
                        }
                    }
                    // Constant typeof when the operand type is known
                    Op::TypeOf => {
                        let t = op_ty(&instr.args[0], func);
                        if let Some(idx) = typeof_string(t, ctx) {
                            instr.op = Op::Const;
                            instr.args = vec![Operand::Imm(Const::Str(idx))];
                            changed = true;
                        }
                    }
                    _ => {}
                }
                rewritten.push(instr);
            }
            func.blocks[bi].instrs = rewritten;
        }
        changed
    }
}

/// Int32 specialization is valid for ops whose int32 result semantics the
/// backends implement directly (Div/Mod stay generic: their results escape
/// the int32 range).
fn int_safe(b: BinOp) -> bool {
    !matches!(b, BinOp::Div | BinOp::Mod | BinOp::Ushr)
}

/// Float specialization only applies to real arithmetic; the bitwise
/// operators are int32 by construction.
fn float_safe(b: BinOp) -> bool {
    matches!(b, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod)
}

fn result_type_int(b: BinOp) -> JsType {
    match b {
        BinOp::Ushr => JsType::Float64,
        _ => JsType::Int32,
    }
}

fn typeof_string(t: JsType, ctx: &PassCtx) -> Option<u32> {
    Some(match t {
        JsType::Undefined => ctx.strings.undefined_,
        JsType::Null | JsType::Object | JsType::Array => ctx.strings.object_,
        JsType::Boolean => ctx.strings.boolean_,
        JsType::Int32 | JsType::Float64 => ctx.strings.number_,
        JsType::String => ctx.strings.string_,
        JsType::Function => ctx.strings.function_,
        JsType::Unknown | JsType::Mixed => return None,
    })
}

/// Insert a guard before the instruction for each feedback-typed register
/// operand that has not been guarded yet.
fn plant_guards(
    instr: &Instr,
    hinted: &FxHashSet<VReg>,
    guarded: &mut FxHashSet<VReg>,
    guard: Op,
    out: &mut Vec<Instr>,
) {
    for r in instr.reg_uses() {
        if hinted.contains(&r) && guarded.insert(r) {
            out.push(Instr { op: guard, dest: None, args: vec![Operand::Reg(r)], bc: instr.bc });
        }
    }
}

/// Forward type inference to a fixed point: constants and typed ops define
/// types, phis join their sources, everything else defaults to what the
/// builder recorded.
pub fn infer_types(func: &mut IrFunction) {
    let rpo = reverse_postorder(func);
    let mut types: FxHashMap<VReg, JsType> = func.reg_types.clone();

    loop {
        let mut changed = false;
        for &bid in &rpo {
            for instr in &func.block(bid).instrs {
                let dest = match instr.dest {
                    Some(d) => d,
                    None => continue,
                };
                let operand_ty = |o: &Operand| -> JsType {
                    match o {
                        Operand::Reg(r) => types.get(r).copied().unwrap_or(JsType::Unknown),
                        Operand::Imm(c) => c.ty(),
                        Operand::Block(_) => JsType::Unknown,
                    }
                };
                let inferred = match instr.op {
                    Op::Const => instr.args[0].as_imm().map(|c| c.ty()).unwrap_or(JsType::Unknown),
                    Op::Move => operand_ty(&instr.args[0]),
                    Op::Phi => {
                        // Sources are the odd positions of (block, reg) pairs
                        let mut t = JsType::Unknown;
                        for pair in instr.args.chunks(2) {
                            if let Some(src) = pair.get(1) {
                                t = t.join(operand_ty(src));
                            }
                        }
                        t
                    }
                    Op::BinInt(b) => result_type_int(b),
                    Op::BinFloat(_) | Op::NegFloat | Op::Fma | Op::ToNumber => JsType::Float64,
                    Op::NegInt | Op::BitNot | Op::ToInt32 | Op::DoubleToInt32 => JsType::Int32,
                    Op::Int32ToDouble => JsType::Float64,
                    Op::Bin(b) => {
                        let lt = operand_ty(&instr.args[0]);
                        let rt = operand_ty(&instr.args[1]);
                        match b {
                            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl
                            | BinOp::Shr => JsType::Int32,
                            BinOp::Ushr => JsType::Float64,
                            BinOp::Add if lt == JsType::String || rt == JsType::String => {
                                JsType::String
                            }
                            _ if lt.is_numeric() && rt.is_numeric() => JsType::Float64,
                            _ => types.get(&dest).copied().unwrap_or(JsType::Unknown),
                        }
                    }
                    Op::Cmp(_) | Op::CmpInt(_) | Op::CmpFloat(_) | Op::CmpStr(_) | Op::Not
                    | Op::ToBoolean | Op::InstanceOf | Op::In | Op::DelProp | Op::DelElem => {
                        JsType::Boolean
                    }
                    Op::ConcatStr | Op::ToString | Op::TypeOf => JsType::String,
                    Op::NewObject => JsType::Object,
                    Op::NewArray => JsType::Array,
                    Op::VecWidth => JsType::Int32,
                    // Loads keep whatever annotation they carry
                    _ => types.get(&dest).copied().unwrap_or(JsType::Unknown),
                };
                let current = types.get(&dest).copied().unwrap_or(JsType::Unknown);
                // Annotated loads keep their feedback type; joins only widen
                let merged = match instr.op {
                    Op::LoadLocal | Op::LoadArg | Op::LoadGlobal | Op::Call | Op::GetProp
                    | Op::GetElem | Op::GetElemOffset => current,
                    _ => inferred,
                };
                if merged != current {
                    types.insert(dest, merged);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    func.reg_types = types;
}
