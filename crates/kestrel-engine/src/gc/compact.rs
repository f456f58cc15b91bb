//! Compaction
//!
//! Optional defragmentation after a major sweep: live cells slide toward the
//! low end of the slot table. Phase one assigns forwarding slots; phase two
//! moves the cells; phase three rewrites every reference — heap edges via the
//! mutable trace visitor, then roots and weak entries. Large objects are
//! pinned and never move.

use rustc_hash::FxHashMap;

use super::cell::Generation;
use super::heap::{GcRef, Heap};
use super::roots::RootSet;
use super::weak::WeakTable;

/// Compact the heap in place. Returns the number of cells moved.
pub fn compact(heap: &mut Heap, roots: &mut RootSet, weak: &mut WeakTable) -> usize {
    // Phase 1: forwarding assignment. Live cells pack into ascending slots;
    // pinned (large) cells keep theirs, and their slots are skipped.
    let live = heap.all_slots();
    let pinned: Vec<bool> = live
        .iter()
        .map(|&s| {
            heap.get(GcRef(s))
                .map(|c| c.header.generation == Generation::LargeObject)
                .unwrap_or(false)
        })
        .collect();

    let mut forwarding: FxHashMap<u32, u32> = FxHashMap::default();
    let mut next: u32 = 0;
    let taken: rustc_hash::FxHashSet<u32> = live
        .iter()
        .zip(&pinned)
        .filter(|(_, &p)| p)
        .map(|(&s, _)| s)
        .collect();
    for (&slot, &is_pinned) in live.iter().zip(&pinned) {
        if is_pinned {
            continue;
        }
        while taken.contains(&next) {
            next += 1;
        }
        if next < slot {
            forwarding.insert(slot, next);
            next += 1;
        } else {
            // Already packed at or below its position
            next = next.max(slot + 1);
        }
    }

    if forwarding.is_empty() {
        return 0;
    }

    // Record the forwarding address in each moving cell
    for (&from, &to) in &forwarding {
        if let Some(cell) = heap.get_mut(GcRef(from)) {
            cell.header.forwarding = Some(to);
        }
    }

    // Phase 2: move the boxes
    let slots = heap.slots_mut();
    for (&from, &to) in &forwarding {
        let mut cell = slots[from as usize].take();
        if let Some(c) = &mut cell {
            c.header.forwarding = None;
        }
        slots[to as usize] = cell;
    }

    // Phase 3: rewrite references everywhere
    let rewrite = |r: &mut GcRef| {
        if let Some(&to) = forwarding.get(&r.0) {
            *r = GcRef(to);
        }
    };
    let all_after: Vec<u32> = (0..heap.slots_mut().len() as u32).collect();
    for slot in all_after {
        if let Some(cell) = heap.slots_mut()[slot as usize].as_mut() {
            cell.object.trace_mut(&mut |r| rewrite(r));
        }
    }
    roots.rewrite(&mut |r| rewrite(r));
    weak.rewrite(&mut |r| rewrite(r));

    heap.rebuild_generation_sets();
    forwarding.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::HeapObject;
    use crate::gc::GcConfig;
    use crate::value::Value;

    fn fragmented_heap() -> (Heap, GcRef, GcRef) {
        let mut h = Heap::new(&GcConfig { nursery_size: 1024 * 1024, ..Default::default() });
        // Allocate a, filler, b; then free the filler to leave a hole
        let a = h.try_alloc(HeapObject::new_object()).unwrap();
        let filler = h.try_alloc(HeapObject::new_object()).unwrap();
        let b = h.try_alloc(HeapObject::new_object()).unwrap();
        h.set_property(a, "b", Value::Object(b));
        h.free_slot(filler.0);
        (h, a, b)
    }

    #[test]
    fn test_compaction_closes_holes_and_rewrites_edges() {
        let (mut h, a, b) = fragmented_heap();
        let mut roots = RootSet::new();
        roots.add(a);
        roots.add(b);
        let mut weak = WeakTable::new();
        let w = weak.create(b);

        let moved = compact(&mut h, &mut roots, &mut weak);
        assert_eq!(moved, 1); // b slides into the filler's slot

        // Root rewritten to the new location
        let new_b = roots.iter().nth(1).unwrap();
        assert_eq!(new_b, GcRef(1));
        assert!(h.get(new_b).is_some());

        // The a→b edge was rewritten too
        match h.get_property(a, "b") {
            Some(Value::Object(r)) => assert_eq!(r, new_b),
            other => panic!("expected rewritten edge, got {:?}", other),
        }

        // Weak entry follows the move
        assert_eq!(weak.get(w), Some(new_b));
    }

    #[test]
    fn test_compaction_idempotent_when_packed() {
        let (mut h, a, b) = fragmented_heap();
        let mut roots = RootSet::new();
        roots.add(a);
        roots.add(b);
        let mut weak = WeakTable::new();
        compact(&mut h, &mut roots, &mut weak);
        let moved_again = compact(&mut h, &mut roots, &mut weak);
        assert_eq!(moved_again, 0);
    }

    #[test]
    fn test_large_objects_pinned() {
        let mut h = Heap::new(&GcConfig {
            nursery_size: 1024 * 1024,
            large_object_threshold: 1024,
            ..Default::default()
        });
        let hole = h.try_alloc(HeapObject::new_object()).unwrap();
        let big = h.try_alloc(HeapObject::Data(vec![0u8; 2048])).unwrap();
        h.free_slot(hole.0);
        let mut roots = RootSet::new();
        roots.add(big);
        let mut weak = WeakTable::new();
        compact(&mut h, &mut roots, &mut weak);
        // The large object kept its slot
        assert_eq!(roots.iter().next().unwrap(), big);
        assert!(h.get(big).is_some());
    }
}
