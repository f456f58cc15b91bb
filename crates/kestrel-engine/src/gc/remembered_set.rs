//! Remembered set
//!
//! Per-source record of cross-generation outgoing references, kept alongside
//! the card table. Partial collections treat the recorded targets as roots.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::heap::GcRef;

/// The remembered set.
pub struct RememberedSet {
    edges: Mutex<FxHashMap<u32, FxHashSet<u32>>>,
}

impl RememberedSet {
    /// Empty set.
    pub fn new() -> Self {
        RememberedSet { edges: Mutex::new(FxHashMap::default()) }
    }

    /// Record `parent → child`.
    pub fn add(&self, parent: GcRef, child: GcRef) {
        self.edges.lock().entry(parent.0).or_default().insert(child.0);
    }

    /// Remove one edge.
    pub fn remove(&self, parent: GcRef, child: GcRef) {
        let mut edges = self.edges.lock();
        if let Some(set) = edges.get_mut(&parent.0) {
            set.remove(&child.0);
            if set.is_empty() {
                edges.remove(&parent.0);
            }
        }
    }

    /// Whether the edge is recorded.
    pub fn contains(&self, parent: GcRef, child: GcRef) -> bool {
        self.edges
            .lock()
            .get(&parent.0)
            .map(|s| s.contains(&child.0))
            .unwrap_or(false)
    }

    /// Drop every edge from or to `slot` (the cell died).
    pub fn remove_slot(&self, slot: u32) {
        let mut edges = self.edges.lock();
        edges.remove(&slot);
        edges.retain(|_, set| {
            set.remove(&slot);
            !set.is_empty()
        });
    }

    /// Snapshot of all edges.
    pub fn edges(&self) -> Vec<(GcRef, GcRef)> {
        self.edges
            .lock()
            .iter()
            .flat_map(|(&p, set)| set.iter().map(move |&c| (GcRef(p), GcRef(c))))
            .collect()
    }

    /// Total recorded edges.
    pub fn len(&self) -> usize {
        self.edges.lock().values().map(|s| s.len()).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.edges.lock().clear();
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contains_remove() {
        let rs = RememberedSet::new();
        rs.add(GcRef(1), GcRef(2));
        assert!(rs.contains(GcRef(1), GcRef(2)));
        assert!(!rs.contains(GcRef(2), GcRef(1)));
        rs.remove(GcRef(1), GcRef(2));
        assert!(rs.is_empty());
    }

    #[test]
    fn test_remove_slot_prunes_both_directions() {
        let rs = RememberedSet::new();
        rs.add(GcRef(1), GcRef(2));
        rs.add(GcRef(3), GcRef(1));
        rs.remove_slot(1);
        assert!(rs.is_empty());
    }

    #[test]
    fn test_edges_snapshot() {
        let rs = RememberedSet::new();
        rs.add(GcRef(1), GcRef(2));
        rs.add(GcRef(1), GcRef(3));
        let mut edges = rs.edges();
        edges.sort();
        assert_eq!(edges, vec![(GcRef(1), GcRef(2)), (GcRef(1), GcRef(3))]);
        assert_eq!(rs.len(), 2);
    }
}
