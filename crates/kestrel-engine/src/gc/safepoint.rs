//! Safepoint coordination
//!
//! The mutator is interruptible only at explicit safepoints: hot-loop
//! back-edges, function entry, calls, and allocations that may collect. The
//! poll is a single atomic load on the fast path; when a pause is pending
//! the mutator runs the collection at the poll site. Pause statistics
//! accumulate here.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Coordinates pauses between the mutator and the collector.
pub struct SafepointCoordinator {
    gc_pending: AtomicBool,
    total_safepoints: AtomicUsize,
    total_pause_us: AtomicU64,
    max_pause_us: AtomicU64,
}

impl SafepointCoordinator {
    /// New coordinator with nothing pending.
    pub fn new() -> Self {
        SafepointCoordinator {
            gc_pending: AtomicBool::new(false),
            total_safepoints: AtomicUsize::new(0),
            total_pause_us: AtomicU64::new(0),
            max_pause_us: AtomicU64::new(0),
        }
    }

    /// Request a collection at the next safepoint.
    pub fn request_gc(&self) {
        self.gc_pending.store(true, Ordering::Release);
    }

    /// Fast-path poll: true when a pause is pending.
    #[inline(always)]
    pub fn pending(&self) -> bool {
        self.gc_pending.load(Ordering::Acquire)
    }

    /// Consume a pending request, if any.
    pub fn take_pending(&self) -> bool {
        self.gc_pending.swap(false, Ordering::AcqRel)
    }

    /// Record a completed pause.
    pub fn record_pause(&self, pause: Duration) {
        self.total_safepoints.fetch_add(1, Ordering::Relaxed);
        let us = pause.as_micros() as u64;
        self.total_pause_us.fetch_add(us, Ordering::Relaxed);
        self.max_pause_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Safepoints taken.
    pub fn total_safepoints(&self) -> usize {
        self.total_safepoints.load(Ordering::Relaxed)
    }

    /// Cumulative pause time.
    pub fn total_pause(&self) -> Duration {
        Duration::from_micros(self.total_pause_us.load(Ordering::Relaxed))
    }

    /// Longest single pause.
    pub fn max_pause(&self) -> Duration {
        Duration::from_micros(self.max_pause_us.load(Ordering::Relaxed))
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
