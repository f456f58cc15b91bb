//! Bytecode interpreter
//!
//! The always-available execution tier and the target every deoptimization
//! returns to. Runs an explicit frame stack (so safepoints can root every
//! live value and OSR/deopt can snapshot activations), feeds the profiler on
//! branches, calls, and typed arithmetic sites, polls the GC at back-edges,
//! calls, and allocations, and dispatches exception unwinding through the
//! bytecode handler tables.

pub mod frame;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::bytecode::{Module, Opcode};
use crate::gc::{Gc, GcError, HeapObject};
use crate::ir::instr::DeoptReason;
use crate::ir::types::JsType;
use crate::tier::{Tier, TierController};
use crate::value::Value;

pub use frame::{Frame, FrameSnapshot};

/// Runtime errors. Only `Thrown` is JS-observable; the rest surface through
/// the embedding API.
#[derive(Debug, Error)]
pub enum VmError {
    /// A JS exception left the outermost frame
    #[error("uncaught exception")]
    Thrown(Value),
    /// Call depth exceeded the configured bound (JS RangeError)
    #[error("maximum call stack size exceeded")]
    StackOverflow,
    /// Malformed bytecode: an emitter bug, fatal for the realm
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
    /// The heap gave up
    #[error(transparent)]
    OutOfMemory(#[from] GcError),
}

/// The interpreter configuration.
pub struct Interpreter {
    /// Maximum simultaneous frames
    pub max_call_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter { max_call_depth: 1024 }
    }
}

/// Mutable execution environment for one realm.
pub struct ExecEnv<'a> {
    /// The module under execution
    pub module: &'a Module,
    /// Global bindings
    pub globals: &'a mut FxHashMap<Arc<str>, Value>,
    /// The collector
    pub gc: &'a mut Gc,
    /// The tier controller (owns the profiler)
    pub tier: &'a TierController,
}

impl Interpreter {
    /// Execute `func_index` with `args`, returning its value.
    pub fn run(
        &self,
        env: &mut ExecEnv<'_>,
        func_index: u32,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let func = env
            .module
            .functions
            .get(func_index as usize)
            .ok_or_else(|| VmError::InvalidBytecode(format!("no function {}", func_index)))?;
        env.tier.on_function_entry(func_index);

        let mut frames = vec![Frame::new(func_index, args, func.arity, func.local_count)];

        loop {
            let frame = frames.last_mut().expect("frame stack never empty");
            let func = &env.module.functions[frame.func_index as usize];
            let pc = frame.pc as usize;
            let instr = match func.code.get(pc) {
                Some(i) => *i,
                None => {
                    return Err(VmError::InvalidBytecode(format!(
                        "pc {} past end of function {}",
                        pc, frame.func_index
                    )))
                }
            };
            frame.pc += 1;

            macro_rules! pop {
                () => {
                    match frames.last_mut().unwrap().stack.pop() {
                        Some(v) => v,
                        None => {
                            return Err(VmError::InvalidBytecode(format!(
                                "stack underflow at {}",
                                pc
                            )))
                        }
                    }
                };
            }
            macro_rules! push {
                ($v:expr) => {
                    frames.last_mut().unwrap().stack.push($v)
                };
            }

            match instr.opcode {
                Opcode::Nop | Opcode::TryEnter | Opcode::TryLeave => {}
                Opcode::Pop => {
                    pop!();
                }
                Opcode::Dup => {
                    let top = frames.last().unwrap().stack.last().cloned().ok_or_else(|| {
                        VmError::InvalidBytecode(format!("stack underflow at {}", pc))
                    })?;
                    push!(top);
                }
                Opcode::Swap => {
                    let f = frames.last_mut().unwrap();
                    let n = f.stack.len();
                    if n < 2 {
                        return Err(VmError::InvalidBytecode(format!(
                            "stack underflow at {}",
                            pc
                        )));
                    }
                    f.stack.swap(n - 1, n - 2);
                }

                Opcode::ConstUndefined => push!(Value::Undefined),
                Opcode::ConstNull => push!(Value::Null),
                Opcode::ConstTrue => push!(Value::Boolean(true)),
                Opcode::ConstFalse => push!(Value::Boolean(false)),
                Opcode::ConstI32 => push!(Value::Number(instr.a as i32 as f64)),
                Opcode::LoadConst => {
                    let v = self.load_constant(env.module, instr.a)?;
                    push!(v);
                }

                Opcode::LoadLocal => {
                    let f = frames.last().unwrap();
                    let v = f
                        .locals
                        .get(instr.a as usize)
                        .cloned()
                        .ok_or_else(|| VmError::InvalidBytecode("bad local".to_string()))?;
                    push!(v);
                }
                Opcode::StoreLocal => {
                    let v = pop!();
                    let f = frames.last_mut().unwrap();
                    match f.locals.get_mut(instr.a as usize) {
                        Some(slot) => *slot = v,
                        None => return Err(VmError::InvalidBytecode("bad local".to_string())),
                    }
                }
                Opcode::LoadArg => {
                    let f = frames.last().unwrap();
                    let v = f
                        .args
                        .get(instr.a as usize)
                        .cloned()
                        .ok_or_else(|| VmError::InvalidBytecode("bad argument".to_string()))?;
                    push!(v);
                }
                Opcode::StoreArg => {
                    let v = pop!();
                    let f = frames.last_mut().unwrap();
                    match f.args.get_mut(instr.a as usize) {
                        Some(slot) => *slot = v,
                        None => return Err(VmError::InvalidBytecode("bad argument".to_string())),
                    }
                }
                Opcode::LoadGlobal => {
                    let name = self.string(env.module, instr.a)?;
                    let v = env.globals.get(&name).cloned().unwrap_or(Value::Undefined);
                    push!(v);
                }
                Opcode::StoreGlobal => {
                    let v = pop!();
                    let name = self.string(env.module, instr.a)?;
                    env.globals.insert(name, v);
                }

                Opcode::GetProp => {
                    let obj = pop!();
                    let name = self.string(env.module, instr.a)?;
                    let fi = frames.last().unwrap().func_index;
                    env.tier.shared().profiler.record_type(fi, pc as u32, kind_of(&obj));
                    let v = match obj.as_object() {
                        Some(r) => env.gc.heap().get_property(r, &name).unwrap_or(Value::Undefined),
                        None => Value::Undefined,
                    };
                    push!(v);
                }
                Opcode::SetProp => {
                    let value = pop!();
                    let obj = pop!();
                    let name = self.string(env.module, instr.a)?;
                    if let Some(r) = obj.as_object() {
                        if let Some(child) = value.as_object() {
                            env.gc.write_barrier(r, child);
                        }
                        env.gc.heap_mut().set_property(r, &name, value);
                    }
                }
                Opcode::DelProp => {
                    let obj = pop!();
                    let name = self.string(env.module, instr.a)?;
                    let deleted = match obj.as_object() {
                        Some(r) => match env.gc.heap_mut().get_mut(r) {
                            Some(cell) => match &mut cell.object {
                                HeapObject::Object(o) => o.properties.remove(&*name).is_some(),
                                _ => false,
                            },
                            None => false,
                        },
                        None => false,
                    };
                    push!(Value::Boolean(deleted));
                }
                Opcode::GetElem => {
                    let index = pop!();
                    let obj = pop!();
                    let v = match (obj.as_object(), index_of(&index)) {
                        (Some(r), Some(i)) => {
                            env.gc.heap().get_element(r, i).unwrap_or(Value::Undefined)
                        }
                        (Some(r), None) => {
                            let key = index.to_js_string();
                            env.gc.heap().get_property(r, &key).unwrap_or(Value::Undefined)
                        }
                        _ => Value::Undefined,
                    };
                    push!(v);
                }
                Opcode::SetElem => {
                    let value = pop!();
                    let index = pop!();
                    let obj = pop!();
                    if let Some(r) = obj.as_object() {
                        if let Some(child) = value.as_object() {
                            env.gc.write_barrier(r, child);
                        }
                        match index_of(&index) {
                            Some(i) => env.gc.heap_mut().set_element(r, i, value),
                            None => {
                                let key = index.to_js_string();
                                env.gc.heap_mut().set_property(r, &key, value);
                            }
                        }
                    }
                }
                Opcode::DelElem => {
                    let index = pop!();
                    let obj = pop!();
                    let deleted = match (obj.as_object(), index_of(&index)) {
                        (Some(r), Some(i)) => match env.gc.heap_mut().get_mut(r) {
                            Some(cell) => match &mut cell.object {
                                HeapObject::Object(o) if i < o.elements.len() => {
                                    o.elements[i] = Value::Undefined;
                                    true
                                }
                                _ => false,
                            },
                            None => false,
                        },
                        _ => false,
                    };
                    push!(Value::Boolean(deleted));
                }

                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod => {
                    let b = pop!();
                    let a = pop!();
                    let fi = frames.last().unwrap().func_index;
                    let profiler = &env.tier.shared().profiler;
                    profiler.record_type(fi, pc as u32, kind_of(&a));
                    profiler.record_type(fi, pc as u32, kind_of(&b));
                    self.check_speculation(env, fi, pc as u32, &a, &b);
                    let v = match instr.opcode {
                        Opcode::Add => js_add(&a, &b),
                        Opcode::Sub => Value::Number(a.to_number() - b.to_number()),
                        Opcode::Mul => Value::Number(a.to_number() * b.to_number()),
                        Opcode::Div => Value::Number(a.to_number() / b.to_number()),
                        _ => Value::Number(a.to_number() % b.to_number()),
                    };
                    push!(v);
                }
                Opcode::Neg => {
                    let a = pop!();
                    push!(Value::Number(-a.to_number()));
                }
                Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr => {
                    let b = pop!();
                    let a = pop!();
                    let (x, y) = (a.to_int32(), b.to_int32());
                    let r = match instr.opcode {
                        Opcode::BitAnd => x & y,
                        Opcode::BitOr => x | y,
                        Opcode::BitXor => x ^ y,
                        Opcode::Shl => x.wrapping_shl(y as u32 & 31),
                        _ => x.wrapping_shr(y as u32 & 31),
                    };
                    push!(Value::Number(r as f64));
                }
                Opcode::Ushr => {
                    let b = pop!();
                    let a = pop!();
                    let r = a.to_uint32().wrapping_shr(b.to_uint32() & 31);
                    push!(Value::Number(r as f64));
                }
                Opcode::BitNot => {
                    let a = pop!();
                    push!(Value::Number(!a.to_int32() as f64));
                }
                Opcode::Not => {
                    let a = pop!();
                    push!(Value::Boolean(!a.to_boolean()));
                }

                Opcode::Eq | Opcode::Ne | Opcode::StrictEq | Opcode::StrictNe | Opcode::Lt
                | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let b = pop!();
                    let a = pop!();
                    let fi = frames.last().unwrap().func_index;
                    let profiler = &env.tier.shared().profiler;
                    profiler.record_type(fi, pc as u32, kind_of(&a));
                    profiler.record_type(fi, pc as u32, kind_of(&b));
                    let v = match instr.opcode {
                        Opcode::Eq => js_loose_eq(&a, &b),
                        Opcode::Ne => !js_loose_eq(&a, &b),
                        Opcode::StrictEq => js_strict_eq(&a, &b),
                        Opcode::StrictNe => !js_strict_eq(&a, &b),
                        Opcode::Lt => js_less(&a, &b),
                        Opcode::Le => !js_less(&b, &a) && ordered(&a, &b),
                        Opcode::Gt => js_less(&b, &a),
                        _ => !js_less(&a, &b) && ordered(&a, &b),
                    };
                    push!(Value::Boolean(v));
                }

                Opcode::Jump => {
                    let target = instr.a;
                    let fi = frames.last().unwrap().func_index;
                    if target as usize <= pc {
                        env.tier.on_back_edge(fi, target);
                        self.safepoint(env, &frames);
                    }
                    frames.last_mut().unwrap().pc = target;
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let cond = pop!().to_boolean();
                    let jump_on = instr.opcode == Opcode::JumpIfTrue;
                    let taken = cond == jump_on;
                    let fi = frames.last().unwrap().func_index;
                    env.tier.shared().profiler.record_branch(fi, pc as u32, taken);
                    if taken {
                        let target = instr.a;
                        if target as usize <= pc {
                            env.tier.on_back_edge(fi, target);
                            self.safepoint(env, &frames);
                        }
                        frames.last_mut().unwrap().pc = target;
                    }
                }

                Opcode::Call => {
                    if frames.len() >= self.max_call_depth {
                        return Err(VmError::StackOverflow);
                    }
                    let callee = instr.a;
                    let argc = instr.b as usize;
                    self.safepoint(env, &frames);
                    let f = frames.last_mut().unwrap();
                    if f.stack.len() < argc {
                        return Err(VmError::InvalidBytecode("call underflow".to_string()));
                    }
                    let args: Vec<Value> = f.stack.drain(f.stack.len() - argc..).collect();
                    let fi = f.func_index;
                    env.tier.shared().profiler.record_call(fi, pc as u32, callee);
                    env.tier.on_function_entry(callee);

                    let target = env
                        .module
                        .functions
                        .get(callee as usize)
                        .ok_or_else(|| VmError::InvalidBytecode("bad callee".to_string()))?;
                    frames.push(Frame::new(callee, args, target.arity, target.local_count));
                }
                Opcode::Return | Opcode::ReturnUndefined => {
                    let value = if instr.opcode == Opcode::Return {
                        pop!()
                    } else {
                        Value::Undefined
                    };
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => caller.stack.push(value),
                        None => return Ok(value),
                    }
                }

                Opcode::Throw => {
                    let value = pop!();
                    if !self.unwind(env.module, &mut frames, value.clone()) {
                        return Err(VmError::Thrown(value));
                    }
                }

                Opcode::NewObject => {
                    self.safepoint(env, &frames);
                    let r = self.alloc_rooted(env, &frames, HeapObject::new_object())?;
                    push!(Value::Object(r));
                }
                Opcode::NewArray => {
                    self.safepoint(env, &frames);
                    let n = instr.a as usize;
                    let r = self.alloc_rooted(env, &frames, HeapObject::new_array(n))?;
                    let f = frames.last_mut().unwrap();
                    if f.stack.len() < n {
                        return Err(VmError::InvalidBytecode("array underflow".to_string()));
                    }
                    let elems: Vec<Value> = f.stack.drain(f.stack.len() - n..).collect();
                    for (i, v) in elems.into_iter().enumerate() {
                        if let Some(child) = v.as_object() {
                            env.gc.write_barrier(r, child);
                        }
                        env.gc.heap_mut().set_element(r, i, v);
                    }
                    push!(Value::Object(r));
                }

                Opcode::TypeOf => {
                    let a = pop!();
                    push!(Value::String(a.type_of().into()));
                }
                Opcode::InstanceOf => {
                    let ctor = pop!();
                    let value = pop!();
                    push!(Value::Boolean(js_instanceof(env, &value, &ctor)));
                }
                Opcode::In => {
                    let obj = pop!();
                    let key = pop!();
                    let found = match obj.as_object() {
                        Some(r) => {
                            let name = key.to_js_string();
                            env.gc.heap().get_property(r, &name).is_some()
                                || index_of(&key)
                                    .and_then(|i| env.gc.heap().get_element(r, i))
                                    .is_some()
                        }
                        None => false,
                    };
                    push!(Value::Boolean(found));
                }
            }
        }
    }

    /// Guard modeling for speculated sites: once a function runs at an
    /// optimizing tier with an int32 speculation planted at this offset, a
    /// non-int operand is the guard failure and triggers deoptimization.
    fn check_speculation(
        &self,
        env: &mut ExecEnv<'_>,
        func_index: u32,
        offset: u32,
        a: &Value,
        b: &Value,
    ) {
        if env.tier.tier_of(func_index) < Tier::Optimizing {
            return;
        }
        let speculated = env
            .tier
            .shared()
            .cache
            .current(func_index)
            .map(|art| art.blob.deopt_table.iter().any(|e| e.bc == offset))
            .unwrap_or(false);
        if !speculated {
            return;
        }
        let int_ok = |v: &Value| v.as_int32().is_some();
        if !int_ok(a) || !int_ok(b) {
            env.tier.deoptimize(func_index, offset, DeoptReason::TypeInstability);
        }
    }

    /// Allocate with every frame-held reference rooted, so the collection an
    /// allocation failure triggers cannot free live values.
    fn alloc_rooted(
        &self,
        env: &mut ExecEnv<'_>,
        frames: &[Frame],
        object: HeapObject,
    ) -> Result<crate::gc::GcRef, VmError> {
        let mut refs = Vec::new();
        for frame in frames {
            frame.gather_roots(&mut refs);
        }
        for v in env.globals.values() {
            if let Some(r) = v.as_object() {
                refs.push(r);
            }
        }
        for &r in &refs {
            env.gc.roots().add(r);
        }
        let result = env.gc.alloc(object);
        for &r in &refs {
            env.gc.roots().remove(r);
        }
        Ok(result?)
    }

    /// Poll the collector, rooting every frame-held reference for the pause.
    fn safepoint(&self, env: &mut ExecEnv<'_>, frames: &[Frame]) {
        if !env.gc.safepoint().pending() {
            return;
        }
        let mut refs = Vec::new();
        for frame in frames {
            frame.gather_roots(&mut refs);
        }
        for v in env.globals.values() {
            if let Some(r) = v.as_object() {
                refs.push(r);
            }
        }
        for &r in &refs {
            env.gc.roots().add(r);
        }
        env.gc.poll();
        for &r in &refs {
            env.gc.roots().remove(r);
        }
    }

    /// Unwind to the innermost handler covering the current pc. Returns
    /// false when no frame has one.
    fn unwind(&self, module: &Module, frames: &mut Vec<Frame>, thrown: Value) -> bool {
        while let Some(frame) = frames.last_mut() {
            let func = &module.functions[frame.func_index as usize];
            let pc = frame.pc.saturating_sub(1);
            let handler = func
                .handlers
                .iter()
                .filter(|h| h.try_start <= pc && pc < h.try_end)
                .max_by_key(|h| h.try_start)
                .copied();
            if let Some(h) = handler {
                frame.stack.clear();
                frame.stack.push(thrown);
                frame.pc = h.catch_offset;
                return true;
            }
            frames.pop();
        }
        false
    }

    fn string(&self, module: &Module, index: u32) -> Result<Arc<str>, VmError> {
        module
            .strings
            .get(index)
            .cloned()
            .ok_or_else(|| VmError::InvalidBytecode(format!("bad string index {}", index)))
    }

    fn load_constant(&self, module: &Module, index: u32) -> Result<Value, VmError> {
        use crate::bytecode::Constant;
        let c = module
            .constants
            .get(index)
            .ok_or_else(|| VmError::InvalidBytecode(format!("bad constant {}", index)))?;
        Ok(match c {
            Constant::Undefined => Value::Undefined,
            Constant::Null => Value::Null,
            Constant::Boolean(b) => Value::Boolean(*b),
            Constant::Number(n) => Value::Number(*n),
            Constant::String(s) => Value::String(self.string(module, *s)?),
            Constant::FunctionRef(i) => Value::Number(*i as f64),
            Constant::ObjectTemplate(_) | Constant::RegExpTemplate(..) => Value::Undefined,
        })
    }
}

// ===== JS operator semantics =====

/// Observed kind for profiler feedback.
pub fn kind_of(v: &Value) -> JsType {
    match v {
        Value::Undefined => JsType::Undefined,
        Value::Null => JsType::Null,
        Value::Boolean(_) => JsType::Boolean,
        Value::Number(_) => {
            if v.as_int32().is_some() {
                JsType::Int32
            } else {
                JsType::Float64
            }
        }
        Value::String(_) => JsType::String,
        Value::BigInt(_) | Value::Symbol(_) => JsType::Mixed,
        Value::Object(_) => JsType::Object,
    }
}

fn index_of(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n < u32::MAX as f64 => {
            Some(*n as usize)
        }
        _ => None,
    }
}

/// JS `+`: string concatenation when either side is a string, numeric add
/// otherwise.
pub fn js_add(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::String(_), _) | (_, Value::String(_)) => {
            let mut s = a.to_js_string().to_string();
            s.push_str(&b.to_js_string());
            Value::String(s.into())
        }
        _ => Value::Number(a.to_number() + b.to_number()),
    }
}

/// Strict equality (`===`): same type, same value; NaN is unequal to itself.
pub fn js_strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => x == y,
        _ => false,
    }
}

/// Loose equality (`==`), restricted to the coercions the core models.
/// `null`/`undefined` are loosely equal only to each other, never through
/// numeric coercion.
pub fn js_loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
        (Value::Object(x), Value::Object(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        _ => a.to_number() == b.to_number(),
    }
}

/// Abstract `<`: lexicographic for string pairs, numeric otherwise.
pub fn js_less(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x < y,
        _ => a.to_number() < b.to_number(),
    }
}

/// Whether both sides are comparable (neither coerces to NaN) — `<=`/`>=`
/// are false when either side is unordered.
fn ordered(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(_), Value::String(_)) => true,
        _ => !a.to_number().is_nan() && !b.to_number().is_nan(),
    }
}

fn js_instanceof(env: &ExecEnv<'_>, value: &Value, ctor: &Value) -> bool {
    let (mut proto, target) = match (value.as_object(), ctor.as_object()) {
        (Some(v), Some(c)) => {
            let target = match env.gc.heap().get_property(c, "prototype") {
                Some(Value::Object(p)) => p,
                _ => return false,
            };
            let first = match env.gc.heap().get(v).map(|cell| &cell.object) {
                Some(HeapObject::Object(o)) => o.prototype,
                _ => None,
            };
            (first, target)
        }
        _ => return false,
    };
    while let Some(p) = proto {
        if p == target {
            return true;
        }
        proto = match env.gc.heap().get(p).map(|cell| &cell.object) {
            Some(HeapObject::Object(o)) => o.prototype,
            _ => None,
        };
    }
    false
}
