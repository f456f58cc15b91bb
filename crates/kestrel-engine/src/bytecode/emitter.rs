//! AST → bytecode emission
//!
//! The emitter keeps a label table and a pending-jump multimap: forward jumps
//! are emitted with a zeroed target and patched when the label is defined.
//! A module with unresolved jumps at the end of emission is malformed and is
//! rejected, never installed.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ast::{BinaryOp, Expr, FunctionDecl, Program, Stmt, UnaryOp};
use crate::value::f64_to_int32;

use super::module::{ExceptionHandler, Function, Instruction, Module};
use super::opcode::Opcode;
use super::verify;

/// Errors raised during emission.
#[derive(Debug, Error)]
pub enum EmitError {
    /// A label was referenced but never defined
    #[error("unresolved label {0} in function '{1}'")]
    UnresolvedLabel(u32, String),
    /// A label was defined twice
    #[error("label {0} defined twice")]
    DuplicateLabel(u32),
    /// Verification failed after emission
    #[error(transparent)]
    Verify(#[from] verify::VerifyError),
    /// Unknown callee name
    #[error("call to undefined function '{0}'")]
    UndefinedFunction(String),
}

/// Peephole pre-pass selection, keyed by optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeepholeLevel {
    /// Emit as-is
    None,
    /// Literal constant folding only
    Fold,
    /// Folding + unreachable-code elimination + jump threading
    Full,
}

/// Label allocator and patch table for one function body.
struct LabelTable {
    /// label id → instruction index, once defined
    defined: FxHashMap<u32, u32>,
    /// label id → instruction indices whose operand awaits the target
    pending: FxHashMap<u32, Vec<u32>>,
    next: u32,
}

impl LabelTable {
    fn new() -> Self {
        LabelTable {
            defined: FxHashMap::default(),
            pending: FxHashMap::default(),
            next: 0,
        }
    }

    fn fresh(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Bytecode emitter over the AST contract.
pub struct Emitter {
    level: PeepholeLevel,
}

impl Emitter {
    /// Create an emitter with the given peephole level.
    pub fn new(level: PeepholeLevel) -> Self {
        Emitter { level }
    }

    /// Emit a whole program: one function per declaration plus a synthetic
    /// main holding the top-level statements.
    pub fn emit_module(&self, program: &Program, name: &str) -> Result<Module, EmitError> {
        let mut module = Module::new(name.to_string());

        // Function indices are resolved by name before any body is emitted;
        // main occupies index 0.
        let mut func_ids: FxHashMap<&str, u32> = FxHashMap::default();
        func_ids.insert("<main>", 0);
        for (i, decl) in program.functions.iter().enumerate() {
            func_ids.insert(decl.name.as_str(), (i + 1) as u32);
        }

        let main_decl = FunctionDecl {
            name: "<main>".to_string(),
            params: Vec::new(),
            strict: false,
            body: program.body.clone(),
        };
        let main = self.emit_function(&main_decl, &func_ids, &mut module)?;
        module.functions.push(main);

        for decl in &program.functions {
            let func = self.emit_function(decl, &func_ids, &mut module)?;
            module.functions.push(func);
        }
        Ok(module)
    }

    fn emit_function(
        &self,
        decl: &FunctionDecl,
        func_ids: &FxHashMap<&str, u32>,
        module: &mut Module,
    ) -> Result<Function, EmitError> {
        let name_idx = module.strings.intern(&decl.name);
        let mut ctx = FunctionCtx {
            func: Function::new(name_idx, decl.params.len() as u32),
            labels: LabelTable::new(),
            locals: FxHashMap::default(),
            params: FxHashMap::default(),
            func_ids,
            module,
            func_name: decl.name.clone(),
        };
        ctx.func.strict = decl.strict;
        for (i, p) in decl.params.iter().enumerate() {
            ctx.params.insert(p.clone(), i as u32);
        }

        for stmt in &decl.body {
            ctx.emit_stmt(stmt)?;
        }
        ctx.emit(Instruction::new(Opcode::ReturnUndefined));

        let mut func = ctx.finish()?;
        if self.level >= PeepholeLevel::Fold {
            fold_literals(&mut func);
        }
        if self.level >= PeepholeLevel::Full {
            thread_jumps(&mut func);
            eliminate_unreachable(&mut func);
        }
        func.max_stack = verify::verify_function(&func)?;
        Ok(func)
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Emitter::new(PeepholeLevel::Full)
    }
}

/// Per-function emission state.
struct FunctionCtx<'a> {
    func: Function,
    labels: LabelTable,
    locals: FxHashMap<String, u32>,
    params: FxHashMap<String, u32>,
    func_ids: &'a FxHashMap<&'a str, u32>,
    module: &'a mut Module,
    func_name: String,
}

impl<'a> FunctionCtx<'a> {
    fn emit(&mut self, instr: Instruction) -> u32 {
        let idx = self.func.code.len() as u32;
        self.func.code.push(instr);
        idx
    }

    /// Emit a branch to a possibly not-yet-defined label.
    fn emit_jump(&mut self, opcode: Opcode, label: u32) {
        if let Some(&target) = self.labels.defined.get(&label) {
            self.emit(Instruction::with_a(opcode, target));
        } else {
            let at = self.emit(Instruction::with_a(opcode, 0));
            self.labels.pending.entry(label).or_default().push(at);
        }
    }

    /// Define a label at the current offset, patching all pending jumps to it.
    fn define_label(&mut self, label: u32) -> Result<(), EmitError> {
        let offset = self.func.code.len() as u32;
        if self.labels.defined.insert(label, offset).is_some() {
            return Err(EmitError::DuplicateLabel(label));
        }
        if let Some(sites) = self.labels.pending.remove(&label) {
            for site in sites {
                self.func.code[site as usize].a = offset;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Function, EmitError> {
        if let Some((&label, _)) = self.labels.pending.iter().next() {
            return Err(EmitError::UnresolvedLabel(label, self.func_name));
        }
        self.func.local_count = self.locals.len() as u32;
        Ok(self.func)
    }

    fn local_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.locals.get(name) {
            return slot;
        }
        let slot = self.locals.len() as u32;
        self.locals.insert(name.to_string(), slot);
        self.func.local_names.push(self.module.strings.intern(name));
        slot
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), EmitError> {
        match stmt {
            Stmt::Expr(e) => {
                self.emit_expr(e)?;
                self.emit(Instruction::new(Opcode::Pop));
            }
            Stmt::Let { name, init } => {
                match init {
                    Some(e) => self.emit_expr(e)?,
                    None => {
                        self.emit(Instruction::new(Opcode::ConstUndefined));
                    }
                }
                let slot = self.local_slot(name);
                self.emit(Instruction::with_a(Opcode::StoreLocal, slot));
            }
            Stmt::Assign { target, value } => {
                self.emit_expr(value)?;
                if let Some(&slot) = self.params.get(target) {
                    self.emit(Instruction::with_a(Opcode::StoreArg, slot));
                } else if let Some(&slot) = self.locals.get(target) {
                    self.emit(Instruction::with_a(Opcode::StoreLocal, slot));
                } else {
                    let idx = self.module.strings.intern(target);
                    self.emit(Instruction::with_a(Opcode::StoreGlobal, idx));
                }
            }
            Stmt::If { cond, then_branch, else_branch } => {
                let else_label = self.labels.fresh();
                let end_label = self.labels.fresh();
                self.emit_expr(cond)?;
                self.emit_jump(Opcode::JumpIfFalse, else_label);
                for s in then_branch {
                    self.emit_stmt(s)?;
                }
                self.emit_jump(Opcode::Jump, end_label);
                self.define_label(else_label)?;
                for s in else_branch {
                    self.emit_stmt(s)?;
                }
                self.define_label(end_label)?;
            }
            Stmt::While { cond, body } => {
                let head = self.labels.fresh();
                let exit = self.labels.fresh();
                self.define_label(head)?;
                self.emit_expr(cond)?;
                self.emit_jump(Opcode::JumpIfFalse, exit);
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.emit_jump(Opcode::Jump, head);
                self.define_label(exit)?;
            }
            Stmt::Return(e) => match e {
                Some(e) => {
                    self.emit_expr(e)?;
                    self.emit(Instruction::new(Opcode::Return));
                }
                None => {
                    self.emit(Instruction::new(Opcode::ReturnUndefined));
                }
            },
            Stmt::Throw(e) => {
                self.emit_expr(e)?;
                self.emit(Instruction::new(Opcode::Throw));
            }
            Stmt::Try { body, catch_var, catch_body, finally_body } => {
                let handler_index = self.func.handlers.len() as u32;
                // Handler offsets are patched once the regions are laid out.
                self.func.handlers.push(ExceptionHandler {
                    try_start: 0,
                    try_end: 0,
                    catch_offset: 0,
                    finally_offset: None,
                    catch_var_index: 0,
                });

                let catch_label = self.labels.fresh();
                let finally_label = self.labels.fresh();
                let end_label = self.labels.fresh();

                self.emit(Instruction::with_a(Opcode::TryEnter, handler_index));
                let try_start = self.func.code.len() as u32;
                for s in body {
                    self.emit_stmt(s)?;
                }
                let try_end = self.func.code.len() as u32;
                self.emit(Instruction::new(Opcode::TryLeave));
                self.emit_jump(
                    Opcode::Jump,
                    if finally_body.is_empty() { end_label } else { finally_label },
                );

                self.define_label(catch_label)?;
                let catch_offset = self.func.code.len() as u32;
                let catch_slot = match catch_var {
                    Some(v) => {
                        let slot = self.local_slot(v);
                        self.emit(Instruction::with_a(Opcode::StoreLocal, slot));
                        slot
                    }
                    None => {
                        self.emit(Instruction::new(Opcode::Pop));
                        0
                    }
                };
                for s in catch_body {
                    self.emit_stmt(s)?;
                }

                let finally_offset = if finally_body.is_empty() {
                    None
                } else {
                    self.define_label(finally_label)?;
                    let off = self.func.code.len() as u32;
                    for s in finally_body {
                        self.emit_stmt(s)?;
                    }
                    Some(off)
                };
                self.define_label(end_label)?;

                self.func.handlers[handler_index as usize] = ExceptionHandler {
                    try_start,
                    try_end,
                    catch_offset,
                    finally_offset,
                    catch_var_index: catch_slot,
                };
            }
        }
        Ok(())
    }

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), EmitError> {
        match expr {
            Expr::Undefined => {
                self.emit(Instruction::new(Opcode::ConstUndefined));
            }
            Expr::Null => {
                self.emit(Instruction::new(Opcode::ConstNull));
            }
            Expr::Boolean(true) => {
                self.emit(Instruction::new(Opcode::ConstTrue));
            }
            Expr::Boolean(false) => {
                self.emit(Instruction::new(Opcode::ConstFalse));
            }
            Expr::Number(n) => {
                if n.fract() == 0.0
                    && *n >= i32::MIN as f64
                    && *n <= i32::MAX as f64
                    && !(*n == 0.0 && n.is_sign_negative())
                {
                    self.emit(Instruction::with_a(Opcode::ConstI32, *n as i32 as u32));
                } else {
                    let idx = self.module.constants.add_number(*n);
                    self.emit(Instruction::with_a(Opcode::LoadConst, idx));
                }
            }
            Expr::String(s) => {
                let str_idx = self.module.strings.intern(s);
                let idx = self.module.constants.add_string(str_idx);
                self.emit(Instruction::with_a(Opcode::LoadConst, idx));
            }
            Expr::Ident(name) => {
                if let Some(&slot) = self.params.get(name) {
                    self.emit(Instruction::with_a(Opcode::LoadArg, slot));
                } else if let Some(&slot) = self.locals.get(name) {
                    self.emit(Instruction::with_a(Opcode::LoadLocal, slot));
                } else {
                    let idx = self.module.strings.intern(name);
                    self.emit(Instruction::with_a(Opcode::LoadGlobal, idx));
                }
            }
            Expr::Unary { op, operand } => {
                self.emit_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitNot,
                    UnaryOp::TypeOf => Opcode::TypeOf,
                };
                self.emit(Instruction::new(opcode));
            }
            Expr::Binary { op, left, right } => {
                self.emit_expr(left)?;
                self.emit_expr(right)?;
                let opcode = match op {
                    BinaryOp::Add => Opcode::Add,
                    BinaryOp::Sub => Opcode::Sub,
                    BinaryOp::Mul => Opcode::Mul,
                    BinaryOp::Div => Opcode::Div,
                    BinaryOp::Mod => Opcode::Mod,
                    BinaryOp::BitAnd => Opcode::BitAnd,
                    BinaryOp::BitOr => Opcode::BitOr,
                    BinaryOp::BitXor => Opcode::BitXor,
                    BinaryOp::Shl => Opcode::Shl,
                    BinaryOp::Shr => Opcode::Shr,
                    BinaryOp::Ushr => Opcode::Ushr,
                    BinaryOp::Eq => Opcode::Eq,
                    BinaryOp::Ne => Opcode::Ne,
                    BinaryOp::StrictEq => Opcode::StrictEq,
                    BinaryOp::StrictNe => Opcode::StrictNe,
                    BinaryOp::Lt => Opcode::Lt,
                    BinaryOp::Le => Opcode::Le,
                    BinaryOp::Gt => Opcode::Gt,
                    BinaryOp::Ge => Opcode::Ge,
                    BinaryOp::InstanceOf => Opcode::InstanceOf,
                    BinaryOp::In => Opcode::In,
                };
                self.emit(Instruction::new(opcode));
            }
            Expr::Call { callee, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                let func_id = *self
                    .func_ids
                    .get(callee.as_str())
                    .ok_or_else(|| EmitError::UndefinedFunction(callee.clone()))?;
                self.emit(Instruction::with_ab(Opcode::Call, func_id, args.len() as u32));
            }
            Expr::Member { object, property } => {
                self.emit_expr(object)?;
                let idx = self.module.strings.intern(property);
                self.emit(Instruction::with_a(Opcode::GetProp, idx));
            }
            Expr::Index { object, index } => {
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.emit(Instruction::new(Opcode::GetElem));
            }
            Expr::ObjectLiteral(props) => {
                self.emit(Instruction::new(Opcode::NewObject));
                for (key, value) in props {
                    self.emit(Instruction::new(Opcode::Dup));
                    self.emit_expr(value)?;
                    let idx = self.module.strings.intern(key);
                    self.emit(Instruction::with_a(Opcode::SetProp, idx));
                }
            }
            Expr::ArrayLiteral(elems) => {
                for e in elems {
                    self.emit_expr(e)?;
                }
                self.emit(Instruction::with_a(Opcode::NewArray, elems.len() as u32));
            }
        }
        Ok(())
    }
}

// ===== Peephole pre-passes =====

/// Fold `ConstI32; ConstI32; <arith>` triples into a single constant push.
/// Runs to a local fixed point so chains like `1+2+3` collapse fully.
fn fold_literals(func: &mut Function) {
    loop {
        let mut changed = false;
        let mut i = 0;
        while i + 2 < func.code.len() {
            let (a, b, op) = (func.code[i], func.code[i + 1], func.code[i + 2]);
            if a.opcode != Opcode::ConstI32 || b.opcode != Opcode::ConstI32 {
                i += 1;
                continue;
            }
            if instr_is_branch_target(func, i + 1) || instr_is_branch_target(func, i + 2) {
                i += 1;
                continue;
            }
            let (x, y) = (a.a as i32, b.a as i32);
            let folded = match op.opcode {
                Opcode::Add => Some(x.wrapping_add(y)),
                Opcode::Sub => Some(x.wrapping_sub(y)),
                Opcode::Mul => Some(x.wrapping_mul(y)),
                Opcode::BitAnd => Some(x & y),
                Opcode::BitOr => Some(x | y),
                Opcode::BitXor => Some(x ^ y),
                Opcode::Shl => Some(x.wrapping_shl(y as u32 & 31)),
                Opcode::Shr => Some(x.wrapping_shr(y as u32 & 31)),
                Opcode::Ushr => Some(((x as u32).wrapping_shr(y as u32 & 31)) as i32),
                // Division folds only when the result stays an int32
                Opcode::Div if y != 0 && x % y == 0 => Some(x.wrapping_div(y)),
                Opcode::Mod if y != 0 => Some(f64_to_int32((x as f64) % (y as f64))),
                _ => None,
            };
            if let Some(v) = folded {
                func.code[i] = Instruction::with_a(Opcode::ConstI32, v as u32);
                remove_instrs(func, i + 1, 2);
                changed = true;
            } else {
                i += 1;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Rewrite jumps whose target is itself an unconditional jump to the ultimate
/// target. Cycles (a jump chain that loops) are left alone.
fn thread_jumps(func: &mut Function) {
    for i in 0..func.code.len() {
        let op = func.code[i].opcode;
        if !matches!(op, Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse) {
            continue;
        }
        let mut target = func.code[i].a;
        let mut hops = 0;
        while let Some(t) = func.code.get(target as usize) {
            if t.opcode != Opcode::Jump || hops > func.code.len() {
                break;
            }
            target = t.a;
            hops += 1;
        }
        func.code[i].a = target;
    }
}

/// Remove instructions unreachable from entry under a conservative CFG:
/// fallthrough plus branch targets; Return/Throw end a path. Removed slots
/// become Nop so no offsets shift.
fn eliminate_unreachable(func: &mut Function) {
    let len = func.code.len();
    let mut reachable = vec![false; len];
    let mut worklist: Vec<usize> = vec![0];
    // Handler entry points are roots too
    for h in &func.handlers {
        worklist.push(h.catch_offset as usize);
        if let Some(f) = h.finally_offset {
            worklist.push(f as usize);
        }
    }
    while let Some(at) = worklist.pop() {
        if at >= len || reachable[at] {
            continue;
        }
        reachable[at] = true;
        let instr = func.code[at];
        match instr.opcode {
            Opcode::Jump => worklist.push(instr.a as usize),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                worklist.push(instr.a as usize);
                worklist.push(at + 1);
            }
            Opcode::Return | Opcode::ReturnUndefined | Opcode::Throw => {}
            _ => worklist.push(at + 1),
        }
    }
    for (i, instr) in func.code.iter_mut().enumerate() {
        if !reachable[i] {
            *instr = Instruction::new(Opcode::Nop);
        }
    }
}

fn instr_is_branch_target(func: &Function, index: usize) -> bool {
    let idx = index as u32;
    func.code.iter().any(|instr| {
        matches!(
            instr.opcode,
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse
        ) && instr.a == idx
    }) || func.handlers.iter().any(|h| {
        h.catch_offset == idx || h.finally_offset == Some(idx) || h.try_start == idx
    })
}

/// Remove `count` instructions starting at `at`, shifting branch targets and
/// handler offsets that point past the removed range.
fn remove_instrs(func: &mut Function, at: usize, count: usize) {
    func.code.drain(at..at + count);
    let at = at as u32;
    let count = count as u32;
    let fix = |target: &mut u32| {
        if *target > at {
            *target -= count;
        }
    };
    for instr in &mut func.code {
        if matches!(
            instr.opcode,
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse
        ) {
            fix(&mut instr.a);
        }
    }
    for h in &mut func.handlers {
        fix(&mut h.try_start);
        fix(&mut h.try_end);
        fix(&mut h.catch_offset);
        if let Some(f) = &mut h.finally_offset {
            fix(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn emit_body(body: Vec<Stmt>) -> Module {
        let program = Program { functions: vec![], body };
        Emitter::default().emit_module(&program, "test").unwrap()
    }

    fn num(n: f64) -> Expr {
        Expr::Number(n)
    }

    fn add(l: Expr, r: Expr) -> Expr {
        Expr::Binary { op: BinaryOp::Add, left: Box::new(l), right: Box::new(r) }
    }

    #[test]
    fn test_literal_addition_folds() {
        let module = emit_body(vec![Stmt::Return(Some(add(num(5.0), num(10.0))))]);
        let main = &module.functions[0];
        // 5 + 10 folds at emit time: a single constant feeds Return
        assert!(main
            .code
            .iter()
            .any(|i| i.opcode == Opcode::ConstI32 && i.a == 15));
        assert!(!main.code.iter().any(|i| i.opcode == Opcode::Add));
    }

    #[test]
    fn test_fold_chain() {
        let module = emit_body(vec![Stmt::Return(Some(add(add(num(1.0), num(2.0)), num(3.0))))]);
        let main = &module.functions[0];
        assert!(main
            .code
            .iter()
            .any(|i| i.opcode == Opcode::ConstI32 && i.a == 6));
    }

    #[test]
    fn test_while_loop_labels_resolve() {
        // let i = 0; while (i < 10) { i = i + 1; } return i;
        let body = vec![
            Stmt::Let { name: "i".to_string(), init: Some(num(0.0)) },
            Stmt::While {
                cond: Expr::Binary {
                    op: BinaryOp::Lt,
                    left: Box::new(Expr::Ident("i".to_string())),
                    right: Box::new(num(10.0)),
                },
                body: vec![Stmt::Assign {
                    target: "i".to_string(),
                    value: add(Expr::Ident("i".to_string()), num(1.0)),
                }],
            },
            Stmt::Return(Some(Expr::Ident("i".to_string()))),
        ];
        let module = emit_body(body);
        let main = &module.functions[0];
        // All branch targets land inside the function
        for instr in &main.code {
            if matches!(
                instr.opcode,
                Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse
            ) {
                assert!((instr.a as usize) < main.code.len());
            }
        }
        // One backward jump (the loop latch)
        let backward = main
            .code
            .iter()
            .enumerate()
            .filter(|(i, instr)| instr.opcode == Opcode::Jump && (instr.a as usize) <= *i)
            .count();
        assert_eq!(backward, 1);
    }

    #[test]
    fn test_unknown_callee_rejected() {
        let program = Program {
            functions: vec![],
            body: vec![Stmt::Expr(Expr::Call { callee: "nope".to_string(), args: vec![] })],
        };
        let err = Emitter::default().emit_module(&program, "t").unwrap_err();
        assert!(matches!(err, EmitError::UndefinedFunction(_)));
    }

    #[test]
    fn test_try_catch_handler_table() {
        let body = vec![Stmt::Try {
            body: vec![Stmt::Throw(num(1.0))],
            catch_var: Some("e".to_string()),
            catch_body: vec![Stmt::Return(Some(Expr::Ident("e".to_string())))],
            finally_body: vec![],
        }];
        let module = emit_body(body);
        let main = &module.functions[0];
        assert_eq!(main.handlers.len(), 1);
        let h = main.handlers[0];
        assert!(h.try_start <= h.try_end);
        assert!(h.catch_offset >= h.try_end);
        assert!(h.finally_offset.is_none());
    }

    #[test]
    fn test_function_indices_resolved_before_bodies() {
        // mutual recursion: f calls g, g calls f
        let program = Program {
            functions: vec![
                FunctionDecl {
                    name: "f".to_string(),
                    params: vec![],
                    strict: false,
                    body: vec![Stmt::Return(Some(Expr::Call {
                        callee: "g".to_string(),
                        args: vec![],
                    }))],
                },
                FunctionDecl {
                    name: "g".to_string(),
                    params: vec![],
                    strict: false,
                    body: vec![Stmt::Return(Some(Expr::Call {
                        callee: "f".to_string(),
                        args: vec![],
                    }))],
                },
            ],
            body: vec![],
        };
        let module = Emitter::default().emit_module(&program, "t").unwrap();
        assert_eq!(module.functions.len(), 3);
    }
}
