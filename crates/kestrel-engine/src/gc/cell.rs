//! Heap cells: header plus object payload
//!
//! Every cell carries a tri-color mark (atomic, since marking is parallel),
//! an age, a generation tag, and a forwarding slot used during compaction.
//! Payloads expose two visitors: a shared-reference trace for marking and a
//! mutable trace for compaction's pointer rewriting.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::value::Value;

use super::heap::GcRef;

/// Tri-color mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    /// Not reached
    White = 0,
    /// Reached, children pending
    Gray = 1,
    /// Reached, children scanned
    Black = 2,
}

/// Generation tag. The ordering is the promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Generation {
    /// Fresh allocations
    Nursery = 0,
    /// Survived the nursery
    Young = 1,
    /// Middle-aged
    Medium = 2,
    /// Long-lived
    Old = 3,
    /// Cells at or above the large-object threshold; never copied
    LargeObject = 4,
}

impl Generation {
    /// The next-older generation (identity for Old and LargeObject).
    pub fn promoted(self) -> Generation {
        match self {
            Generation::Nursery => Generation::Young,
            Generation::Young => Generation::Medium,
            Generation::Medium => Generation::Old,
            other => other,
        }
    }
}

/// Per-cell metadata.
#[derive(Debug)]
pub struct CellHeader {
    color: AtomicU8,
    /// Collections survived in the current generation
    pub age: u8,
    /// Current generation
    pub generation: Generation,
    /// New slot during compaction
    pub forwarding: Option<u32>,
    /// Approximate payload size in bytes
    pub size: usize,
}

impl CellHeader {
    /// Header for a fresh allocation.
    pub fn new(generation: Generation, size: usize) -> Self {
        CellHeader {
            color: AtomicU8::new(Color::White as u8),
            age: 0,
            generation,
            forwarding: None,
            size,
        }
    }

    /// Current color.
    pub fn color(&self) -> Color {
        match self.color.load(Ordering::Acquire) {
            0 => Color::White,
            1 => Color::Gray,
            _ => Color::Black,
        }
    }

    /// Unconditional color store.
    pub fn set_color(&self, c: Color) {
        self.color.store(c as u8, Ordering::Release);
    }

    /// White→Gray transition; true when this caller won the race.
    pub fn try_gray(&self) -> bool {
        self.color
            .compare_exchange(
                Color::White as u8,
                Color::Gray as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A JavaScript object: named properties, indexed elements, prototype link.
#[derive(Debug, Default)]
pub struct JsObject {
    /// Named properties
    pub properties: FxHashMap<Arc<str>, Value>,
    /// Dense indexed elements
    pub elements: Vec<Value>,
    /// Prototype chain link
    pub prototype: Option<GcRef>,
}

/// Cell payload.
#[derive(Debug)]
pub enum HeapObject {
    /// Plain object (also used for arrays' backing object)
    Object(JsObject),
    /// A closure/function object referencing its bytecode
    Function {
        /// Index into the module function table
        func_index: u32,
        /// Captured environment, if any
        environment: Option<GcRef>,
    },
    /// Raw byte payload (typed-array storage, large buffers)
    Data(Vec<u8>),
}

impl HeapObject {
    /// Fresh empty object.
    pub fn new_object() -> HeapObject {
        HeapObject::Object(JsObject::default())
    }

    /// Fresh array-like object with `n` elements.
    pub fn new_array(n: usize) -> HeapObject {
        HeapObject::Object(JsObject {
            elements: vec![Value::Undefined; n],
            ..Default::default()
        })
    }

    /// Rough payload footprint, used for budget accounting.
    pub fn approx_size(&self) -> usize {
        match self {
            HeapObject::Object(o) => {
                64 + o.properties.len() * 48 + o.elements.len() * 16
            }
            HeapObject::Function { .. } => 48,
            HeapObject::Data(d) => 32 + d.len(),
        }
    }

    /// Shared-reference trace: yields every outgoing reference. Used by the
    /// marker.
    pub fn trace(&self, f: &mut dyn FnMut(GcRef)) {
        match self {
            HeapObject::Object(o) => {
                for v in o.properties.values() {
                    if let Some(r) = v.as_object() {
                        f(r);
                    }
                }
                for v in &o.elements {
                    if let Some(r) = v.as_object() {
                        f(r);
                    }
                }
                if let Some(p) = o.prototype {
                    f(p);
                }
            }
            HeapObject::Function { environment, .. } => {
                if let Some(e) = environment {
                    f(*e);
                }
            }
            HeapObject::Data(_) => {}
        }
    }

    /// Mutable trace: yields every outgoing reference for rewriting. Used by
    /// compaction.
    pub fn trace_mut(&mut self, f: &mut dyn FnMut(&mut GcRef)) {
        match self {
            HeapObject::Object(o) => {
                for v in o.properties.values_mut() {
                    if let Value::Object(r) = v {
                        f(r);
                    }
                }
                for v in &mut o.elements {
                    if let Value::Object(r) = v {
                        f(r);
                    }
                }
                if let Some(p) = &mut o.prototype {
                    f(p);
                }
            }
            HeapObject::Function { environment, .. } => {
                if let Some(e) = environment {
                    f(e);
                }
            }
            HeapObject::Data(_) => {}
        }
    }
}

/// A cell: header plus payload.
#[derive(Debug)]
pub struct GcBox {
    /// Metadata
    pub header: CellHeader,
    /// Payload
    pub object: HeapObject,
}
