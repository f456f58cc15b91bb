//! Collector statistics

use std::time::Duration;

use serde::Serialize;

use super::{CollectionKind, GcCause};

/// Accumulated collector statistics, serializable for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    /// Total collections
    pub collections: usize,
    /// Minor cycles
    pub minor_collections: usize,
    /// Medium cycles
    pub medium_collections: usize,
    /// Major cycles
    pub major_collections: usize,
    /// Objects freed over the lifetime
    pub objects_freed: usize,
    /// Bytes freed over the lifetime
    pub bytes_freed: usize,
    /// Promotions over the lifetime
    pub promotions: usize,
    /// Total pause microseconds
    pub total_pause_us: u64,
    /// Longest pause microseconds
    pub max_pause_us: u64,
    /// Cells marked in the last cycle
    pub last_marked: usize,
    /// Cells freed in the last cycle
    pub last_freed: usize,
    /// Live objects after the last cycle
    pub live_objects: usize,
    /// Live bytes after the last cycle
    pub live_bytes: usize,
    /// Cause of the last cycle
    #[serde(skip)]
    pub last_cause: Option<GcCause>,
}

impl GcStats {
    /// Fold in one completed collection.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        kind: CollectionKind,
        cause: GcCause,
        pause: Duration,
        marked: usize,
        freed_objects: usize,
        freed_bytes: usize,
        promoted: usize,
        live_objects: usize,
        live_bytes: usize,
    ) {
        self.collections += 1;
        match kind {
            CollectionKind::Minor => self.minor_collections += 1,
            CollectionKind::Medium => self.medium_collections += 1,
            CollectionKind::Major => self.major_collections += 1,
        }
        self.objects_freed += freed_objects;
        self.bytes_freed += freed_bytes;
        self.promotions += promoted;
        let us = pause.as_micros() as u64;
        self.total_pause_us += us;
        self.max_pause_us = self.max_pause_us.max(us);
        self.last_marked = marked;
        self.last_freed = freed_objects;
        self.live_objects = live_objects;
        self.live_bytes = live_bytes;
        self.last_cause = Some(cause);
    }

    /// Fraction of marked cells that survived the last cycle.
    pub fn survival_rate(&self) -> f64 {
        if self.last_marked == 0 {
            return 0.0;
        }
        self.live_objects as f64 / self.last_marked as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut s = GcStats::default();
        s.record(
            CollectionKind::Minor,
            GcCause::Allocation,
            Duration::from_micros(50),
            10,
            4,
            512,
            2,
            6,
            1024,
        );
        s.record(
            CollectionKind::Major,
            GcCause::ExplicitRequest,
            Duration::from_micros(200),
            6,
            1,
            64,
            0,
            5,
            960,
        );
        assert_eq!(s.collections, 2);
        assert_eq!(s.minor_collections, 1);
        assert_eq!(s.major_collections, 1);
        assert_eq!(s.objects_freed, 5);
        assert_eq!(s.total_pause_us, 250);
        assert_eq!(s.max_pause_us, 200);
        assert_eq!(s.live_objects, 5);
    }

    #[test]
    fn test_serializes() {
        let s = GcStats::default();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("collections"));
    }
}
