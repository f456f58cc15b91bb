//! Parallel generational garbage collector
//!
//! Five generations (nursery, young, medium, old, large-object) over a
//! slot-indexed heap. Collection is generational: a minor cycle covers the
//! nursery and young generation, a medium cycle adds the medium generation,
//! a major cycle covers everything. Cross-generation references are tracked
//! by a card table plus remembered set maintained by the write barrier.
//! Marking is tri-color and runs on a work-stealing worker pool; sweeping can
//! run concurrently on a background thread; compaction is optional and runs
//! in major cycles.

pub mod card_table;
pub mod cell;
pub mod compact;
pub mod heap;
pub mod marker;
pub mod remembered_set;
pub mod roots;
pub mod safepoint;
pub mod stats;
pub mod sweeper;
pub mod weak;

use thiserror::Error;

pub use cell::{CellHeader, Color, GcBox, Generation, HeapObject, JsObject};
pub use heap::{GcRef, Heap};
pub use roots::RootSet;
pub use safepoint::SafepointCoordinator;
pub use stats::GcStats;
pub use weak::{WeakRef, WeakTable};

use marker::mark_parallel;
use sweeper::{sweep, ConcurrentSweeper};

/// Collection scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Nursery + young
    Minor,
    /// Nursery + young + medium
    Medium,
    /// All generations
    Major,
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// An allocation crossed a generation budget
    Allocation,
    /// Periodic/scheduled
    Scheduled,
    /// `Engine::request_gc`
    ExplicitRequest,
    /// The heap neared its hard cap
    LowMemory,
}

/// GC errors.
#[derive(Debug, Error)]
pub enum GcError {
    /// The heap could not satisfy an allocation even after a full collection
    /// and expansion up to the hard cap
    #[error("out of memory: {requested} bytes requested, heap at {heap_bytes}/{max_bytes}")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Live heap bytes
        heap_bytes: usize,
        /// Hard cap
        max_bytes: usize,
    },
    /// A collector self-check failed (fatal in debug builds)
    #[error("heap invariant violated: {0}")]
    InvariantViolation(String),
}

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery budget in bytes
    pub nursery_size: usize,
    /// Young-generation budget in bytes
    pub young_size: usize,
    /// Medium-generation budget in bytes
    pub medium_size: usize,
    /// Hard heap cap in bytes
    pub max_heap_size: usize,
    /// Cells at or above this size go straight to the large-object space
    pub large_object_threshold: usize,
    /// Survivals needed to leave nursery / young / medium
    pub promotion_ages: [u8; 3],
    /// Mark worker count (0 = cores − 1)
    pub worker_threads: usize,
    /// Drop dead objects on a background thread
    pub enable_concurrent_sweep: bool,
    /// Mark with the worker pool (off = single-threaded mark)
    pub enable_concurrent_mark: bool,
    /// Compact the old generation during major cycles
    pub enable_compaction: bool,
    /// Nursery-occupancy fraction that requests a minor collection
    pub minor_trigger_ratio: f64,
    /// Heap growth factor applied when a full collection cannot free space
    pub heap_growth_factor: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            nursery_size: 2 * 1024 * 1024,
            young_size: 16 * 1024 * 1024,
            medium_size: 64 * 1024 * 1024,
            max_heap_size: 4 * 1024 * 1024 * 1024,
            large_object_threshold: 32 * 1024,
            promotion_ages: [1, 3, 5],
            worker_threads: 0,
            enable_concurrent_sweep: true,
            enable_concurrent_mark: true,
            enable_compaction: true,
            minor_trigger_ratio: 0.7,
            heap_growth_factor: 1.5,
        }
    }
}

impl GcConfig {
    fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            num_cpus::get().saturating_sub(1).max(1)
        }
    }
}

/// The collector for one realm.
pub struct Gc {
    heap: Heap,
    roots: RootSet,
    weak: WeakTable,
    safepoint: SafepointCoordinator,
    sweeper: Option<ConcurrentSweeper>,
    stats: GcStats,
    config: GcConfig,
}

impl Gc {
    /// Create a collector.
    pub fn new(config: GcConfig) -> Self {
        let sweeper = if config.enable_concurrent_sweep {
            Some(ConcurrentSweeper::spawn())
        } else {
            None
        };
        Gc {
            heap: Heap::new(&config),
            roots: RootSet::new(),
            weak: WeakTable::new(),
            safepoint: SafepointCoordinator::new(),
            sweeper,
            stats: GcStats::default(),
            config,
        }
    }

    /// The heap (reads).
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap (mutations outside collection).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The root set.
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// The root set, mutable.
    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// The safepoint coordinator.
    pub fn safepoint(&self) -> &SafepointCoordinator {
        &self.safepoint
    }

    /// Allocate an object, collecting and expanding as needed.
    pub fn alloc(&mut self, object: HeapObject) -> Result<GcRef, GcError> {
        match self.heap.try_alloc(object) {
            Ok(r) => {
                if self.heap.nursery_occupancy() >= self.config.minor_trigger_ratio {
                    self.safepoint.request_gc();
                }
                Ok(r)
            }
            Err(object) => {
                // Allocation failure: collect, then expand, then give up
                self.collect(CollectionKind::Major, GcCause::Allocation);
                match self.heap.try_alloc(object) {
                    Ok(r) => Ok(r),
                    Err(object) => {
                        let requested = object.approx_size();
                        if !self.heap.expand(self.config.heap_growth_factor) {
                            return Err(GcError::OutOfMemory {
                                requested,
                                heap_bytes: self.heap.live_bytes(),
                                max_bytes: self.config.max_heap_size,
                            });
                        }
                        self.heap.try_alloc(object).map_err(|o| GcError::OutOfMemory {
                            requested: o.approx_size(),
                            heap_bytes: self.heap.live_bytes(),
                            max_bytes: self.config.max_heap_size,
                        })
                    }
                }
            }
        }
    }

    /// Create a weak reference to `target`.
    pub fn create_weak(&mut self, target: GcRef) -> WeakRef {
        self.weak.create(target)
    }

    /// Read through a weak reference; `None` once the target is collected.
    pub fn weak_get(&self, weak: WeakRef) -> Option<GcRef> {
        self.weak.get(weak)
    }

    /// The generational write barrier. Call after storing a reference from
    /// `parent` to `child`: an older-to-younger edge marks the parent's card
    /// and records the edge in the remembered set.
    pub fn write_barrier(&self, parent: GcRef, child: GcRef) {
        self.heap.write_barrier(parent, child);
    }

    /// Poll at a safepoint: runs a pending collection if one was requested.
    pub fn poll(&mut self) {
        if self.safepoint.take_pending() {
            self.collect(CollectionKind::Minor, GcCause::Scheduled);
        }
    }

    /// Run a collection.
    pub fn collect(&mut self, kind: CollectionKind, cause: GcCause) {
        let start = std::time::Instant::now();
        let floor = match kind {
            CollectionKind::Minor => Generation::Young,
            CollectionKind::Medium => Generation::Medium,
            CollectionKind::Major => Generation::LargeObject,
        };

        // World-stop begins: whiten the collected generations, gather roots.
        self.heap.whiten(floor);
        let mut roots: Vec<GcRef> = self.roots.iter().collect();
        if kind != CollectionKind::Major {
            // Cross-generation edges from uncollected space act as roots
            roots.extend(self.heap.remembered_roots(floor));
        }

        let workers = if self.config.enable_concurrent_mark {
            self.config.effective_workers()
        } else {
            1
        };
        let marked = mark_parallel(&self.heap, &roots, workers, floor);

        // Weak references to dead targets clear before slots are reused
        self.weak.sweep(&self.heap, floor);

        let outcome = sweep(
            &mut self.heap,
            floor,
            &self.config.promotion_ages,
            self.sweeper.as_ref(),
        );

        if kind == CollectionKind::Major && self.config.enable_compaction {
            compact::compact(&mut self.heap, &mut self.roots, &mut self.weak);
        }

        if kind == CollectionKind::Major {
            self.heap.clear_cards_and_remembered();
        } else {
            self.heap.prune_remembered(floor);
        }

        debug_assert!(self.verify_heap().is_ok());

        self.safepoint.record_pause(start.elapsed());
        self.stats.record(
            kind,
            cause,
            start.elapsed(),
            marked,
            outcome.freed_objects,
            outcome.freed_bytes,
            outcome.promoted,
            self.heap.live_objects(),
            self.heap.live_bytes(),
        );
    }

    /// Collector self-check: every live cell is white (post-sweep), ages are
    /// in range, and every cross-generation reference is covered by a card or
    /// remembered-set entry.
    pub fn verify_heap(&self) -> Result<(), GcError> {
        self.heap.verify()
    }
}
