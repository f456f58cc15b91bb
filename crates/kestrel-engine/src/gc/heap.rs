//! The slot-indexed heap
//!
//! Cells live in a slot table addressed by [`GcRef`]; generations are sets of
//! slot indices with byte budgets. The write barrier, card table, and
//! remembered set live here so the mutator-facing surface is one type.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::value::Value;

use super::card_table::CardTable;
use super::cell::{CellHeader, Color, GcBox, Generation, HeapObject};
use super::remembered_set::RememberedSet;
use super::GcConfig;

/// A heap reference: an index into the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(pub u32);

impl std::fmt::Display for GcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// The heap for one realm.
pub struct Heap {
    slots: Vec<Option<GcBox>>,
    free_slots: Vec<u32>,

    nursery: FxHashSet<u32>,
    young: FxHashSet<u32>,
    medium: FxHashSet<u32>,
    old: FxHashSet<u32>,
    large: FxHashSet<u32>,

    bytes: [usize; 5],
    budgets: [usize; 3], // nursery / young / medium
    max_heap: usize,
    large_threshold: usize,

    cards: CardTable,
    remembered: RememberedSet,
}

impl Heap {
    /// Heap sized from the configuration.
    pub fn new(config: &GcConfig) -> Self {
        Heap {
            slots: Vec::new(),
            free_slots: Vec::new(),
            nursery: FxHashSet::default(),
            young: FxHashSet::default(),
            medium: FxHashSet::default(),
            old: FxHashSet::default(),
            large: FxHashSet::default(),
            bytes: [0; 5],
            budgets: [config.nursery_size, config.young_size, config.medium_size],
            max_heap: config.max_heap_size,
            large_threshold: config.large_object_threshold,
            cards: CardTable::new(),
            remembered: RememberedSet::new(),
        }
    }

    // ===== Allocation =====

    /// Allocate, or give the object back when the relevant budget is
    /// exhausted (the collector then runs and retries).
    pub fn try_alloc(&mut self, object: HeapObject) -> Result<GcRef, HeapObject> {
        let size = object.approx_size();
        let total: usize = self.bytes.iter().sum();
        if total + size > self.max_heap {
            return Err(object);
        }

        let generation = if size >= self.large_threshold {
            Generation::LargeObject
        } else {
            if self.bytes[0] + size > self.budgets[0] {
                return Err(object);
            }
            Generation::Nursery
        };

        let cell = GcBox { header: CellHeader::new(generation, size), object };
        let slot = match self.free_slots.pop() {
            Some(s) => {
                self.slots[s as usize] = Some(cell);
                s
            }
            None => {
                self.slots.push(Some(cell));
                (self.slots.len() - 1) as u32
            }
        };
        self.generation_set_mut(generation).insert(slot);
        self.bytes[generation as usize] += size;
        self.cards.ensure(slot);
        Ok(GcRef(slot))
    }

    /// Grow the per-generation budgets by `factor`, bounded by the hard cap.
    /// Returns false when no growth is possible.
    pub fn expand(&mut self, factor: f64) -> bool {
        let total: usize = self.budgets.iter().sum();
        if total >= self.max_heap {
            return false;
        }
        for b in &mut self.budgets {
            *b = (((*b as f64) * factor) as usize).min(self.max_heap);
        }
        true
    }

    // ===== Accessors =====

    /// Shared cell access.
    pub fn get(&self, r: GcRef) -> Option<&GcBox> {
        self.slots.get(r.0 as usize).and_then(|s| s.as_ref())
    }

    /// Mutable cell access.
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcBox> {
        self.slots.get_mut(r.0 as usize).and_then(|s| s.as_mut())
    }

    /// Set a named property on an object cell. The caller issues the write
    /// barrier when the value holds a reference.
    pub fn set_property(&mut self, obj: GcRef, name: &str, value: Value) {
        if let Some(cell) = self.get_mut(obj) {
            if let HeapObject::Object(o) = &mut cell.object {
                let key: Arc<str> = name.into();
                o.properties.insert(key, value);
            }
        }
    }

    /// Read a named property.
    pub fn get_property(&self, obj: GcRef, name: &str) -> Option<Value> {
        let cell = self.get(obj)?;
        if let HeapObject::Object(o) = &cell.object {
            if let Some(v) = o.properties.get(name) {
                return Some(v.clone());
            }
            // Prototype chain walk
            if let Some(proto) = o.prototype {
                return self.get_property(proto, name);
            }
        }
        None
    }

    /// Set an indexed element, growing the dense storage.
    pub fn set_element(&mut self, obj: GcRef, index: usize, value: Value) {
        if let Some(cell) = self.get_mut(obj) {
            if let HeapObject::Object(o) = &mut cell.object {
                if index >= o.elements.len() {
                    o.elements.resize(index + 1, Value::Undefined);
                }
                o.elements[index] = value;
            }
        }
    }

    /// Read an indexed element.
    pub fn get_element(&self, obj: GcRef, index: usize) -> Option<Value> {
        match &self.get(obj)?.object {
            HeapObject::Object(o) => o.elements.get(index).cloned(),
            _ => None,
        }
    }

    /// Live cell count.
    pub fn live_objects(&self) -> usize {
        self.nursery.len() + self.young.len() + self.medium.len() + self.old.len()
            + self.large.len()
    }

    /// Live bytes across all generations.
    pub fn live_bytes(&self) -> usize {
        self.bytes.iter().sum()
    }

    /// Nursery fill fraction.
    pub fn nursery_occupancy(&self) -> f64 {
        self.bytes[0] as f64 / self.budgets[0].max(1) as f64
    }

    /// Per-generation live byte counts.
    pub fn generation_bytes(&self) -> [usize; 5] {
        self.bytes
    }

    // ===== Write barrier =====

    /// Record an older→younger edge: mark the source's card and remember the
    /// edge. The card store is release-ordered; collection reads acquire.
    pub fn write_barrier(&self, parent: GcRef, child: GcRef) {
        let (pg, cg) = match (self.get(parent), self.get(child)) {
            (Some(p), Some(c)) => (p.header.generation, c.header.generation),
            _ => return,
        };
        if pg > cg && cg < Generation::LargeObject {
            self.cards.mark(parent.0);
            self.remembered.add(parent, child);
        }
    }

    /// Whether the barrier recorded this edge.
    pub fn barrier_covers(&self, parent: GcRef, child: GcRef) -> bool {
        self.cards.is_marked(parent.0) || self.remembered.contains(parent, child)
    }

    // ===== Collection support =====

    fn generation_set_mut(&mut self, g: Generation) -> &mut FxHashSet<u32> {
        match g {
            Generation::Nursery => &mut self.nursery,
            Generation::Young => &mut self.young,
            Generation::Medium => &mut self.medium,
            Generation::Old => &mut self.old,
            Generation::LargeObject => &mut self.large,
        }
    }

    fn generation_set(&self, g: Generation) -> &FxHashSet<u32> {
        match g {
            Generation::Nursery => &self.nursery,
            Generation::Young => &self.young,
            Generation::Medium => &self.medium,
            Generation::Old => &self.old,
            Generation::LargeObject => &self.large,
        }
    }

    /// Whether a generation participates in a collection with this floor.
    pub fn collected(g: Generation, floor: Generation) -> bool {
        if floor == Generation::LargeObject {
            true
        } else {
            g <= floor
        }
    }

    /// Slots in the generations a collection with `floor` covers.
    pub fn collected_slots(&self, floor: Generation) -> Vec<u32> {
        let mut out = Vec::new();
        for g in [
            Generation::Nursery,
            Generation::Young,
            Generation::Medium,
            Generation::Old,
            Generation::LargeObject,
        ] {
            if Self::collected(g, floor) {
                out.extend(self.generation_set(g).iter().copied());
            }
        }
        out
    }

    /// Reset collected cells to white before marking.
    pub fn whiten(&mut self, floor: Generation) {
        for slot in self.collected_slots(floor) {
            if let Some(cell) = &self.slots[slot as usize] {
                cell.header.set_color(Color::White);
            }
        }
    }

    /// Remembered-set targets inside the collected space: the roots that
    /// stand in for uncollected older generations during a partial cycle.
    pub fn remembered_roots(&self, floor: Generation) -> Vec<GcRef> {
        self.remembered
            .edges()
            .into_iter()
            .filter_map(|(parent, child)| {
                let pg = self.get(parent)?.header.generation;
                let cg = self.get(child)?.header.generation;
                if !Self::collected(pg, floor) && Self::collected(cg, floor) {
                    Some(child)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Free a dead slot, returning the payload for deferred dropping.
    pub(super) fn free_slot(&mut self, slot: u32) -> Option<GcBox> {
        let cell = self.slots[slot as usize].take()?;
        let g = cell.header.generation;
        self.generation_set_mut(g).remove(&slot);
        self.bytes[g as usize] = self.bytes[g as usize].saturating_sub(cell.header.size);
        self.remembered.remove_slot(slot);
        self.free_slots.push(slot);
        Some(cell)
    }

    /// Age a surviving cell and promote it when it has seen enough cycles.
    pub(super) fn age_and_promote(&mut self, slot: u32, promotion_ages: &[u8; 3]) -> bool {
        let (current, next) = {
            let cell = match &mut self.slots[slot as usize] {
                Some(c) => c,
                None => return false,
            };
            cell.header.age = cell.header.age.saturating_add(1);
            let g = cell.header.generation;
            let threshold = match g {
                Generation::Nursery => promotion_ages[0],
                Generation::Young => promotion_ages[1],
                Generation::Medium => promotion_ages[2],
                _ => return false,
            };
            if cell.header.age < threshold {
                return false;
            }
            cell.header.age = 0;
            let next = g.promoted();
            cell.header.generation = next;
            (g, next)
        };
        let size = self.slots[slot as usize].as_ref().map(|c| c.header.size).unwrap_or(0);
        self.generation_set_mut(current).remove(&slot);
        self.generation_set_mut(next).insert(slot);
        self.bytes[current as usize] = self.bytes[current as usize].saturating_sub(size);
        self.bytes[next as usize] += size;
        true
    }

    /// Drop all cards and remembered edges (after a major cycle).
    pub fn clear_cards_and_remembered(&mut self) {
        self.cards.clear_all();
        self.remembered.clear();
    }

    /// Drop remembered edges whose target was just collected or promoted out
    /// of the young space.
    pub fn prune_remembered(&mut self, floor: Generation) {
        let dead: Vec<(GcRef, GcRef)> = self
            .remembered
            .edges()
            .into_iter()
            .filter(|&(parent, child)| {
                match (self.get(parent), self.get(child)) {
                    (Some(p), Some(c)) => {
                        // Keep only still-valid older→younger edges
                        !(p.header.generation > c.header.generation
                            && Self::collected(c.header.generation, floor))
                            && p.header.generation <= c.header.generation
                    }
                    _ => true,
                }
            })
            .collect();
        for (p, c) in dead {
            self.remembered.remove(p, c);
        }
    }

    /// All live slot indices (compaction and verification).
    pub fn all_slots(&self) -> Vec<u32> {
        (0..self.slots.len() as u32)
            .filter(|&s| self.slots[s as usize].is_some())
            .collect()
    }

    pub(super) fn slots_mut(&mut self) -> &mut Vec<Option<GcBox>> {
        &mut self.slots
    }

    pub(super) fn rebuild_generation_sets(&mut self) {
        self.nursery.clear();
        self.young.clear();
        self.medium.clear();
        self.old.clear();
        self.large.clear();
        let entries: Vec<(u32, Generation)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (i as u32, c.header.generation)))
            .collect();
        self.free_slots = (0..self.slots.len() as u32)
            .filter(|&i| self.slots[i as usize].is_none())
            .collect();
        for (slot, g) in entries {
            self.generation_set_mut(g).insert(slot);
        }
    }

    /// Self-check: generation sets match headers, byte accounting is sane,
    /// and every live cross-generation edge is covered by the barrier data.
    pub fn verify(&self) -> Result<(), super::GcError> {
        for g in [
            Generation::Nursery,
            Generation::Young,
            Generation::Medium,
            Generation::Old,
            Generation::LargeObject,
        ] {
            for &slot in self.generation_set(g) {
                match self.get(GcRef(slot)) {
                    Some(cell) if cell.header.generation == g => {}
                    _ => {
                        return Err(super::GcError::InvariantViolation(format!(
                            "slot {} misfiled in {:?}",
                            slot, g
                        )))
                    }
                }
            }
        }
        for &slot in self.old.iter().chain(self.medium.iter()) {
            let parent = GcRef(slot);
            let cell = match self.get(parent) {
                Some(c) => c,
                None => continue,
            };
            let mut bad = None;
            cell.object.trace(&mut |child| {
                if bad.is_some() {
                    return;
                }
                if let Some(c) = self.get(child) {
                    if c.header.generation < cell.header.generation
                        && !self.barrier_covers(parent, child)
                    {
                        bad = Some(child);
                    }
                }
            });
            if let Some(child) = bad {
                return Err(super::GcError::InvariantViolation(format!(
                    "unrecorded cross-generation edge {} -> {}",
                    parent, child
                )));
            }
        }
        Ok(())
    }
}
