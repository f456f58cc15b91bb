//! Bytecode → IR lowering
//!
//! A structural one-pass conversion: the operand stack becomes virtual
//! registers, branches become explicit block terminators, and every produced
//! instruction records its originating bytecode offset. Stack values merging
//! at block joins become phis; locals and arguments stay as explicit
//! load/store operations.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::bytecode::{Constant, Function, Module, Opcode};

use super::instr::{
    BinOp, BlockId, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use super::types::JsType;

/// Errors from IR construction. These indicate emitter bugs (the verifier
/// admits only structurally sound functions), so callers treat them as fatal.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A branch target fell outside the function
    #[error("invalid bytecode: branch target {0} out of bounds")]
    BadTarget(u32),
    /// Stack modeling underflowed
    #[error("invalid bytecode: operand stack underflow at offset {0}")]
    Underflow(u32),
    /// A constant-pool index was out of range
    #[error("invalid bytecode: constant {0} out of range")]
    BadConstant(u32),
}

/// Optional type annotations from the profiler, keyed by bytecode offset of
/// the defining instruction.
#[derive(Debug, Clone, Default)]
pub struct TypeHints {
    /// offset → dominant observed type
    pub by_offset: FxHashMap<u32, JsType>,
}

/// Lower one bytecode function to IR.
pub fn build_ir(
    func: &Function,
    module: &Module,
    func_index: u32,
    hints: &TypeHints,
) -> Result<IrFunction, BuildError> {
    let code = &func.code;
    let len = code.len();

    // Block leaders: entry, branch targets, fallthrough after terminators,
    // and exception-handler entry points.
    let mut is_leader = vec![false; len.max(1)];
    is_leader[0] = true;
    for (i, instr) in code.iter().enumerate() {
        match instr.opcode {
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let t = instr.a as usize;
                if t >= len {
                    return Err(BuildError::BadTarget(instr.a));
                }
                is_leader[t] = true;
                if i + 1 < len {
                    is_leader[i + 1] = true;
                }
            }
            Opcode::Return | Opcode::ReturnUndefined | Opcode::Throw => {
                if i + 1 < len {
                    is_leader[i + 1] = true;
                }
            }
            _ => {}
        }
    }
    for h in &func.handlers {
        if (h.catch_offset as usize) < len {
            is_leader[h.catch_offset as usize] = true;
        }
        if let Some(f) = h.finally_offset {
            if (f as usize) < len {
                is_leader[f as usize] = true;
            }
        }
    }

    // Backward-branch targets are loop headers.
    let mut loop_headers: Vec<u32> = Vec::new();
    for (i, instr) in code.iter().enumerate() {
        if matches!(
            instr.opcode,
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse
        ) && (instr.a as usize) <= i
            && !loop_headers.contains(&instr.a)
        {
            loop_headers.push(instr.a);
        }
    }

    let mut ir = IrFunction::new(func_index, func.arity, func.local_count);
    ir.loop_headers = loop_headers.clone();

    let mut block_at: FxHashMap<u32, BlockId> = FxHashMap::default();
    for (offset, leader) in is_leader.iter().enumerate() {
        if *leader {
            let id = ir.add_block(offset as u32);
            block_at.insert(offset as u32, id);
        }
    }

    // Entry stack depth per block, via the same abstract walk the verifier
    // performs. Catch handlers start at depth 1 (the thrown value).
    let entry_depth = compute_entry_depths(func, &block_at)?;

    // Pre-create phi destination registers for each block's entry stack.
    let mut entry_regs: FxHashMap<BlockId, Vec<VReg>> = FxHashMap::default();
    for (&offset, &bid) in &block_at {
        let depth = *entry_depth.get(&offset).unwrap_or(&0);
        let regs: Vec<VReg> = (0..depth).map(|_| ir.alloc_reg(JsType::Unknown)).collect();
        entry_regs.insert(bid, regs);
    }

    // Outgoing stack per CFG edge, for phi population.
    let mut edge_stacks: Vec<(BlockId, BlockId, Vec<VReg>)> = Vec::new();

    let block_ids: Vec<(u32, BlockId)> = {
        let mut v: Vec<(u32, BlockId)> = block_at.iter().map(|(&o, &b)| (o, b)).collect();
        v.sort_by_key(|(o, _)| *o);
        v
    };

    for (bi, &(start, bid)) in block_ids.iter().enumerate() {
        // Skip unreachable blocks (no recorded entry depth and not the entry)
        if start != 0 && !entry_depth.contains_key(&start) {
            ir.block_mut(bid).term = Terminator::Return(None);
            continue;
        }
        let mut stack: Vec<VReg> = entry_regs[&bid].clone();

        // The entry stack is defined by phis at the block head.
        let phis: Vec<Instr> = stack
            .iter()
            .map(|&r| Instr { op: Op::Phi, dest: Some(r), args: Vec::new(), bc: start })
            .collect();
        ir.block_mut(bid).instrs = phis;

        if loop_headers.contains(&start) {
            ir.block_mut(bid)
                .instrs
                .push(Instr { op: Op::Safepoint, dest: None, args: Vec::new(), bc: start });
        }

        let end = block_ids
            .get(bi + 1)
            .map(|&(o, _)| o as usize)
            .unwrap_or(len);

        let mut terminated = false;
        for at in (start as usize)..end {
            let bc = at as u32;
            let instr = code[at];
            let mut push_op = |ir: &mut IrFunction,
                               stack: &mut Vec<VReg>,
                               op: Op,
                               args: Vec<Operand>,
                               ty: JsType| {
                let ty = hints.by_offset.get(&bc).copied().unwrap_or(ty);
                let dest = ir.alloc_reg(ty);
                ir.block_mut(bid).instrs.push(Instr { op, dest: Some(dest), args, bc });
                stack.push(dest);
            };
            let pop = |stack: &mut Vec<VReg>| -> Result<VReg, BuildError> {
                stack.pop().ok_or(BuildError::Underflow(bc))
            };

            match instr.opcode {
                Opcode::Nop | Opcode::TryEnter | Opcode::TryLeave => {}
                Opcode::Pop => {
                    pop(&mut stack)?;
                }
                Opcode::Dup => {
                    let top = *stack.last().ok_or(BuildError::Underflow(bc))?;
                    stack.push(top);
                }
                Opcode::Swap => {
                    let n = stack.len();
                    if n < 2 {
                        return Err(BuildError::Underflow(bc));
                    }
                    stack.swap(n - 1, n - 2);
                }
                Opcode::ConstUndefined => push_op(
                    &mut ir,
                    &mut stack,
                    Op::Const,
                    vec![Operand::Imm(Const::Undefined)],
                    JsType::Undefined,
                ),
                Opcode::ConstNull => push_op(
                    &mut ir,
                    &mut stack,
                    Op::Const,
                    vec![Operand::Imm(Const::Null)],
                    JsType::Null,
                ),
                Opcode::ConstTrue => push_op(
                    &mut ir,
                    &mut stack,
                    Op::Const,
                    vec![Operand::Imm(Const::Bool(true))],
                    JsType::Boolean,
                ),
                Opcode::ConstFalse => push_op(
                    &mut ir,
                    &mut stack,
                    Op::Const,
                    vec![Operand::Imm(Const::Bool(false))],
                    JsType::Boolean,
                ),
                Opcode::ConstI32 => push_op(
                    &mut ir,
                    &mut stack,
                    Op::Const,
                    vec![Operand::Imm(Const::I32(instr.a as i32))],
                    JsType::Int32,
                ),
                Opcode::LoadConst => {
                    let c = module
                        .constants
                        .get(instr.a)
                        .ok_or(BuildError::BadConstant(instr.a))?;
                    let imm = match c {
                        Constant::Undefined => Const::Undefined,
                        Constant::Null => Const::Null,
                        Constant::Boolean(b) => Const::Bool(*b),
                        Constant::Number(n) => Const::F64(*n),
                        Constant::String(s) => Const::Str(*s),
                        // Templates stay interpreter-only; reference them by index
                        Constant::FunctionRef(i) => Const::I32(*i as i32),
                        Constant::ObjectTemplate(_) | Constant::RegExpTemplate(..) => {
                            Const::I32(instr.a as i32)
                        }
                    };
                    let ty = imm.ty();
                    push_op(&mut ir, &mut stack, Op::Const, vec![Operand::Imm(imm)], ty);
                }
                Opcode::LoadLocal => push_op(
                    &mut ir,
                    &mut stack,
                    Op::LoadLocal,
                    vec![Operand::Imm(Const::I32(instr.a as i32))],
                    JsType::Unknown,
                ),
                Opcode::LoadArg => push_op(
                    &mut ir,
                    &mut stack,
                    Op::LoadArg,
                    vec![Operand::Imm(Const::I32(instr.a as i32))],
                    JsType::Unknown,
                ),
                Opcode::LoadGlobal => push_op(
                    &mut ir,
                    &mut stack,
                    Op::LoadGlobal,
                    vec![Operand::Imm(Const::Str(instr.a))],
                    JsType::Unknown,
                ),
                Opcode::StoreLocal | Opcode::StoreArg | Opcode::StoreGlobal => {
                    let v = pop(&mut stack)?;
                    let (op, imm) = match instr.opcode {
                        Opcode::StoreLocal => (Op::StoreLocal, Const::I32(instr.a as i32)),
                        Opcode::StoreArg => (Op::StoreArg, Const::I32(instr.a as i32)),
                        _ => (Op::StoreGlobal, Const::Str(instr.a)),
                    };
                    ir.block_mut(bid).instrs.push(Instr {
                        op,
                        dest: None,
                        args: vec![Operand::Imm(imm), Operand::Reg(v)],
                        bc,
                    });
                }
                Opcode::GetProp => {
                    let obj = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::GetProp,
                        vec![Operand::Reg(obj), Operand::Imm(Const::Str(instr.a))],
                        JsType::Unknown,
                    );
                }
                Opcode::SetProp => {
                    let v = pop(&mut stack)?;
                    let obj = pop(&mut stack)?;
                    ir.block_mut(bid).instrs.push(Instr {
                        op: Op::SetProp,
                        dest: None,
                        args: vec![
                            Operand::Reg(obj),
                            Operand::Imm(Const::Str(instr.a)),
                            Operand::Reg(v),
                        ],
                        bc,
                    });
                }
                Opcode::DelProp => {
                    let obj = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::DelProp,
                        vec![Operand::Reg(obj), Operand::Imm(Const::Str(instr.a))],
                        JsType::Boolean,
                    );
                }
                Opcode::GetElem => {
                    let idx = pop(&mut stack)?;
                    let obj = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::GetElem,
                        vec![Operand::Reg(obj), Operand::Reg(idx)],
                        JsType::Unknown,
                    );
                }
                Opcode::SetElem => {
                    let v = pop(&mut stack)?;
                    let idx = pop(&mut stack)?;
                    let obj = pop(&mut stack)?;
                    ir.block_mut(bid).instrs.push(Instr {
                        op: Op::SetElem,
                        dest: None,
                        args: vec![Operand::Reg(obj), Operand::Reg(idx), Operand::Reg(v)],
                        bc,
                    });
                }
                Opcode::DelElem => {
                    let idx = pop(&mut stack)?;
                    let obj = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::DelElem,
                        vec![Operand::Reg(obj), Operand::Reg(idx)],
                        JsType::Boolean,
                    );
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::BitAnd
                | Opcode::BitOr
                | Opcode::BitXor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Ushr => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let bin = match instr.opcode {
                        Opcode::Add => BinOp::Add,
                        Opcode::Sub => BinOp::Sub,
                        Opcode::Mul => BinOp::Mul,
                        Opcode::Div => BinOp::Div,
                        Opcode::Mod => BinOp::Mod,
                        Opcode::BitAnd => BinOp::BitAnd,
                        Opcode::BitOr => BinOp::BitOr,
                        Opcode::BitXor => BinOp::BitXor,
                        Opcode::Shl => BinOp::Shl,
                        Opcode::Shr => BinOp::Shr,
                        _ => BinOp::Ushr,
                    };
                    // Bitwise results are always int32
                    let ty = match bin {
                        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                            JsType::Int32
                        }
                        BinOp::Ushr => JsType::Float64,
                        _ => JsType::Unknown,
                    };
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::Bin(bin),
                        vec![Operand::Reg(a), Operand::Reg(b)],
                        ty,
                    );
                }
                Opcode::Neg => {
                    let a = pop(&mut stack)?;
                    push_op(&mut ir, &mut stack, Op::Neg, vec![Operand::Reg(a)], JsType::Unknown);
                }
                Opcode::BitNot => {
                    let a = pop(&mut stack)?;
                    push_op(&mut ir, &mut stack, Op::BitNot, vec![Operand::Reg(a)], JsType::Int32);
                }
                Opcode::Not => {
                    let a = pop(&mut stack)?;
                    push_op(&mut ir, &mut stack, Op::Not, vec![Operand::Reg(a)], JsType::Boolean);
                }
                Opcode::Eq
                | Opcode::Ne
                | Opcode::StrictEq
                | Opcode::StrictNe
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let cmp = match instr.opcode {
                        Opcode::Eq => CmpOp::Eq,
                        Opcode::Ne => CmpOp::Ne,
                        Opcode::StrictEq => CmpOp::StrictEq,
                        Opcode::StrictNe => CmpOp::StrictNe,
                        Opcode::Lt => CmpOp::Lt,
                        Opcode::Le => CmpOp::Le,
                        Opcode::Gt => CmpOp::Gt,
                        _ => CmpOp::Ge,
                    };
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::Cmp(cmp),
                        vec![Operand::Reg(a), Operand::Reg(b)],
                        JsType::Boolean,
                    );
                }
                Opcode::TypeOf => {
                    let a = pop(&mut stack)?;
                    push_op(&mut ir, &mut stack, Op::TypeOf, vec![Operand::Reg(a)], JsType::String);
                }
                Opcode::InstanceOf => {
                    let ctor = pop(&mut stack)?;
                    let v = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::InstanceOf,
                        vec![Operand::Reg(v), Operand::Reg(ctor)],
                        JsType::Boolean,
                    );
                }
                Opcode::In => {
                    let obj = pop(&mut stack)?;
                    let key = pop(&mut stack)?;
                    push_op(
                        &mut ir,
                        &mut stack,
                        Op::In,
                        vec![Operand::Reg(key), Operand::Reg(obj)],
                        JsType::Boolean,
                    );
                }
                Opcode::NewObject => {
                    push_op(&mut ir, &mut stack, Op::NewObject, vec![], JsType::Object);
                }
                Opcode::NewArray => {
                    let n = instr.a as usize;
                    if stack.len() < n {
                        return Err(BuildError::Underflow(bc));
                    }
                    let elems: Vec<Operand> =
                        stack.drain(stack.len() - n..).map(Operand::Reg).collect();
                    push_op(&mut ir, &mut stack, Op::NewArray, elems, JsType::Array);
                }
                Opcode::Call => {
                    let argc = instr.b as usize;
                    if stack.len() < argc {
                        return Err(BuildError::Underflow(bc));
                    }
                    let mut args: Vec<Operand> =
                        vec![Operand::Imm(Const::I32(instr.a as i32))];
                    args.extend(stack.drain(stack.len() - argc..).map(Operand::Reg));
                    push_op(&mut ir, &mut stack, Op::Call, args, JsType::Unknown);
                }
                Opcode::Jump => {
                    let target = block_at[&instr.a];
                    edge_stacks.push((bid, target, stack.clone()));
                    ir.block_mut(bid).term = Terminator::Jump(target);
                    terminated = true;
                    break;
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let cond = pop(&mut stack)?;
                    let taken = block_at[&instr.a];
                    let fall = *block_at
                        .get(&(bc + 1))
                        .ok_or(BuildError::BadTarget(bc + 1))?;
                    let (then_block, else_block) = if instr.opcode == Opcode::JumpIfTrue {
                        (taken, fall)
                    } else {
                        (fall, taken)
                    };
                    edge_stacks.push((bid, taken, stack.clone()));
                    edge_stacks.push((bid, fall, stack.clone()));
                    ir.block_mut(bid).term = Terminator::Branch {
                        cond: Operand::Reg(cond),
                        then_block,
                        else_block,
                    };
                    terminated = true;
                    break;
                }
                Opcode::Return => {
                    let v = pop(&mut stack)?;
                    ir.block_mut(bid).term = Terminator::Return(Some(Operand::Reg(v)));
                    terminated = true;
                    break;
                }
                Opcode::ReturnUndefined => {
                    ir.block_mut(bid).term = Terminator::Return(None);
                    terminated = true;
                    break;
                }
                Opcode::Throw => {
                    let v = pop(&mut stack)?;
                    ir.block_mut(bid).term = Terminator::Throw(Operand::Reg(v));
                    terminated = true;
                    break;
                }
            }
        }

        if !terminated {
            // Fallthrough into the next block
            if let Some(&(next_off, next_bid)) = block_ids.get(bi + 1) {
                let _ = next_off;
                edge_stacks.push((bid, next_bid, stack.clone()));
                ir.block_mut(bid).term = Terminator::Jump(next_bid);
            } else {
                ir.block_mut(bid).term = Terminator::Return(None);
            }
        }
    }

    // Populate phi sources from recorded edge stacks.
    for (pred, succ, stack) in edge_stacks {
        let entry = entry_regs[&succ].clone();
        for (slot, &dest) in entry.iter().enumerate() {
            if let Some(&src) = stack.get(slot) {
                let block = ir.block_mut(succ);
                if let Some(phi) = block
                    .instrs
                    .iter_mut()
                    .find(|i| i.op == Op::Phi && i.dest == Some(dest))
                {
                    phi.args.push(Operand::Block(pred));
                    phi.args.push(Operand::Reg(src));
                }
            }
        }
    }

    // Arithmetic-site feedback speculates on the operands feeding the site:
    // an untyped operand register inherits the site's dominant kind, which
    // the specializer later turns into a guarded typed operation.
    let operand_hints: Vec<(VReg, JsType)> = ir
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .filter(|i| matches!(i.op, Op::Bin(_) | Op::Cmp(_)))
        .filter_map(|i| hints.by_offset.get(&i.bc).map(|&t| (i, t)))
        .flat_map(|(i, t)| i.reg_uses().map(move |r| (r, t)))
        .collect();
    for (reg, ty) in operand_hints {
        if ir.reg_type(reg) == JsType::Unknown {
            ir.reg_types.insert(reg, ty);
        }
    }

    ir.recompute_preds();
    simplify_trivial_phis(&mut ir);
    Ok(ir)
}

/// Replace single-source phis with moves; blocks with one predecessor need
/// no merge.
fn simplify_trivial_phis(ir: &mut IrFunction) {
    for block in &mut ir.blocks {
        for instr in &mut block.instrs {
            if instr.op == Op::Phi && instr.args.len() == 2 {
                let src = instr.args[1];
                instr.op = Op::Move;
                instr.args = vec![src];
            }
        }
    }
}

/// Abstract stack depth at each block leader, via a worklist walk.
fn compute_entry_depths(
    func: &Function,
    block_at: &FxHashMap<u32, BlockId>,
) -> Result<FxHashMap<u32, u32>, BuildError> {
    let code = &func.code;
    let len = code.len();
    let mut depth_at_leader: FxHashMap<u32, u32> = FxHashMap::default();
    let mut visited = vec![false; len];
    let mut worklist: Vec<(usize, u32)> = vec![(0, 0)];
    depth_at_leader.insert(0, 0);
    for h in &func.handlers {
        worklist.push((h.catch_offset as usize, 1));
        depth_at_leader.insert(h.catch_offset, 1);
        if let Some(f) = h.finally_offset {
            worklist.push((f as usize, 0));
            depth_at_leader.insert(f, 0);
        }
    }

    while let Some((at, depth)) = worklist.pop() {
        if at >= len || visited[at] {
            continue;
        }
        visited[at] = true;
        let instr = code[at];
        let op = instr.opcode;
        let (pops, pushes) = match op {
            Opcode::Call => (instr.b, 1),
            Opcode::NewArray => (instr.a, 1),
            _ => (op.pops() as u32, op.pushes() as u32),
        };
        if depth < pops {
            return Err(BuildError::Underflow(at as u32));
        }
        let next = depth - pops + pushes;
        let mut record = |target: u32, d: u32, worklist: &mut Vec<(usize, u32)>| {
            if block_at.contains_key(&target) {
                depth_at_leader.entry(target).or_insert(d);
            }
            worklist.push((target as usize, d));
        };
        match op {
            Opcode::Jump => record(instr.a, next, &mut worklist),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                record(instr.a, next, &mut worklist);
                record(at as u32 + 1, next, &mut worklist);
            }
            Opcode::Return | Opcode::ReturnUndefined | Opcode::Throw => {}
            _ => record(at as u32 + 1, next, &mut worklist),
        }
    }
    Ok(depth_at_leader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::module::Instruction;

    fn module_with(code: Vec<Instruction>) -> Module {
        let mut module = Module::new("t".to_string());
        let mut f = Function::new(0, 0);
        f.code = code;
        f.max_stack = crate::bytecode::verify::verify_function(&f).unwrap();
        module.functions.push(f);
        module
    }

    #[test]
    fn test_straight_line_lowering() {
        let module = module_with(vec![
            Instruction::with_a(Opcode::ConstI32, 5),
            Instruction::with_a(Opcode::ConstI32, 10),
            Instruction::new(Opcode::Add),
            Instruction::new(Opcode::Return),
        ]);
        let ir = build_ir(&module.functions[0], &module, 0, &TypeHints::default()).unwrap();
        assert_eq!(ir.blocks.len(), 1);
        let block = &ir.blocks[0];
        assert_eq!(block.instrs.len(), 3);
        assert!(matches!(block.instrs[2].op, Op::Bin(BinOp::Add)));
        assert!(matches!(block.term, Terminator::Return(Some(_))));
        // Every instruction recorded its bytecode offset
        assert_eq!(block.instrs[0].bc, 0);
        assert_eq!(block.instrs[2].bc, 2);
    }

    #[test]
    fn test_branch_becomes_terminator() {
        // if (true) return 1; else return 2;
        let module = module_with(vec![
            Instruction::new(Opcode::ConstTrue),         // 0
            Instruction::with_a(Opcode::JumpIfFalse, 4), // 1
            Instruction::with_a(Opcode::ConstI32, 1),    // 2
            Instruction::new(Opcode::Return),            // 3
            Instruction::with_a(Opcode::ConstI32, 2),    // 4
            Instruction::new(Opcode::Return),            // 5
        ]);
        let ir = build_ir(&module.functions[0], &module, 0, &TypeHints::default()).unwrap();
        assert_eq!(ir.blocks.len(), 3);
        assert!(matches!(ir.blocks[0].term, Terminator::Branch { .. }));
    }

    #[test]
    fn test_loop_header_gets_safepoint() {
        // i = 0; while (i < 3) i = i + 1; return i
        let module = module_with(vec![
            Instruction::with_a(Opcode::ConstI32, 0),     // 0
            Instruction::with_a(Opcode::StoreLocal, 0),   // 1
            Instruction::with_a(Opcode::LoadLocal, 0),    // 2: loop header
            Instruction::with_a(Opcode::ConstI32, 3),     // 3
            Instruction::new(Opcode::Lt),                 // 4
            Instruction::with_a(Opcode::JumpIfFalse, 11), // 5
            Instruction::with_a(Opcode::LoadLocal, 0),    // 6
            Instruction::with_a(Opcode::ConstI32, 1),     // 7
            Instruction::new(Opcode::Add),                // 8
            Instruction::with_a(Opcode::StoreLocal, 0),   // 9
            Instruction::with_a(Opcode::Jump, 2),         // 10
            Instruction::with_a(Opcode::LoadLocal, 0),    // 11
            Instruction::new(Opcode::Return),             // 12
        ]);
        let mut module = module;
        module.functions[0].local_count = 1;
        let ir = build_ir(&module.functions[0], &module, 0, &TypeHints::default()).unwrap();
        assert_eq!(ir.loop_headers, vec![2]);
        let header = ir.blocks.iter().find(|b| b.bc_start == 2).unwrap();
        assert!(header.instrs.iter().any(|i| i.op == Op::Safepoint));
    }

    #[test]
    fn test_type_hints_annotate_registers() {
        let mut hints = TypeHints::default();
        hints.by_offset.insert(0, JsType::Int32);
        let module = module_with(vec![
            Instruction::with_a(Opcode::LoadLocal, 0),
            Instruction::new(Opcode::Return),
        ]);
        let mut module = module;
        module.functions[0].local_count = 1;
        let ir = build_ir(&module.functions[0], &module, 0, &hints).unwrap();
        let load = ir.blocks[0]
            .instrs
            .iter()
            .find(|i| i.op == Op::LoadLocal)
            .unwrap();
        assert_eq!(ir.reg_type(load.dest.unwrap()), JsType::Int32);
    }

    #[test]
    fn test_call_lowering() {
        let module = module_with(vec![
            Instruction::with_a(Opcode::ConstI32, 1),
            Instruction::with_a(Opcode::ConstI32, 2),
            Instruction::with_ab(Opcode::Call, 3, 2),
            Instruction::new(Opcode::Return),
        ]);
        let ir = build_ir(&module.functions[0], &module, 0, &TypeHints::default()).unwrap();
        let call = ir.blocks[0].instrs.iter().find(|i| i.op == Op::Call).unwrap();
        assert_eq!(call.args.len(), 3); // func index + 2 args
        assert_eq!(call.args[0].as_imm(), Some(Const::I32(3)));
    }
}
