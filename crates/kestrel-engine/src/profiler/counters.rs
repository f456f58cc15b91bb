//! Per-function profiling counters
//!
//! Execution and back-edge counters are plain relaxed atomics so the
//! interpreter and JIT-inlined increments never contend on a lock; the
//! per-offset records (branches, type feedback, call sites, loops) sit behind
//! a mutex and are only touched on the paths that already do real work.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::ir::instr::DeoptReason;
use crate::ir::types::JsType;

use super::feedback::{
    BranchCounters, CallSiteClass, CallSiteProfile, DeoptRecord, LoopProfile, TypeFeedback,
    DEOPT_RING_CAPACITY,
};

/// Profiling state for a single function.
pub struct FunctionProfile {
    /// Function entries
    execution_count: AtomicU32,
    /// Back-edges summed over all loops (entry-backedge count)
    total_back_edges: AtomicU32,
    /// Execution count captured at the most recent deopt
    last_deopt_execution: AtomicU32,
    /// Total deopts
    deopts: AtomicU32,
    /// CAS flag claimed by a compile task
    pub compiling: AtomicBool,

    window: usize,
    records: Mutex<OffsetRecords>,
}

#[derive(Default)]
struct OffsetRecords {
    branches: FxHashMap<u32, BranchCounters>,
    types: FxHashMap<u32, TypeFeedback>,
    calls: FxHashMap<u32, CallSiteProfile>,
    loops: FxHashMap<u32, LoopProfile>,
    deopt_ring: Vec<DeoptRecord>,
}

impl FunctionProfile {
    /// Create an empty profile with the given type-feedback window.
    pub fn new(window: usize) -> Self {
        FunctionProfile {
            execution_count: AtomicU32::new(0),
            total_back_edges: AtomicU32::new(0),
            last_deopt_execution: AtomicU32::new(0),
            deopts: AtomicU32::new(0),
            compiling: AtomicBool::new(false),
            window,
            records: Mutex::new(OffsetRecords::default()),
        }
    }

    /// Record a function entry, returning the new count.
    pub fn record_execution(&self) -> u32 {
        self.execution_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a back-edge at `header_offset`, returning that loop's count.
    pub fn record_back_edge(&self, header_offset: u32) -> u32 {
        self.total_back_edges.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        let entry = records.loops.entry(header_offset).or_default();
        entry.iterations += 1;
        entry.iterations as u32
    }

    /// Record a loop entry (the header executing from outside the loop).
    pub fn record_loop_entry(&self, header_offset: u32) {
        let mut records = self.records.lock();
        records.loops.entry(header_offset).or_default().entries += 1;
    }

    /// Record a branch outcome at `offset`.
    pub fn record_branch(&self, offset: u32, taken: bool) {
        let mut records = self.records.lock();
        let counters = records.branches.entry(offset).or_default();
        if taken {
            counters.taken += 1;
        } else {
            counters.not_taken += 1;
        }
    }

    /// Record an observed operand kind at `offset`.
    pub fn record_type(&self, offset: u32, kind: JsType) {
        let window = self.window;
        let mut records = self.records.lock();
        records
            .types
            .entry(offset)
            .or_insert_with(|| TypeFeedback::new(window))
            .observe(kind);
    }

    /// Record a call-site target at `offset`.
    pub fn record_call(&self, offset: u32, target: u32) {
        let mut records = self.records.lock();
        records.calls.entry(offset).or_default().observe(target);
    }

    /// Record a deoptimization.
    pub fn record_deopt(&self, offset: u32, reason: DeoptReason) {
        self.deopts.fetch_add(1, Ordering::Relaxed);
        self.last_deopt_execution
            .store(self.execution_count.load(Ordering::Relaxed), Ordering::Relaxed);
        let mut records = self.records.lock();
        if records.deopt_ring.len() == DEOPT_RING_CAPACITY {
            records.deopt_ring.remove(0);
        }
        let seq = self.deopts.load(Ordering::Relaxed);
        records.deopt_ring.push(DeoptRecord { offset, reason, seq });
    }

    // ===== Reads =====

    /// Current execution count.
    pub fn execution_count(&self) -> u32 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Total back-edges across all loops.
    pub fn total_back_edges(&self) -> u32 {
        self.total_back_edges.load(Ordering::Relaxed)
    }

    /// Back-edge count for one loop header.
    pub fn back_edge_count(&self, header_offset: u32) -> u32 {
        self.records
            .lock()
            .loops
            .get(&header_offset)
            .map(|l| l.iterations as u32)
            .unwrap_or(0)
    }

    /// Mean iterations per loop entry, if the loop has run.
    pub fn mean_iterations(&self, header_offset: u32) -> Option<f64> {
        let records = self.records.lock();
        let l = records.loops.get(&header_offset)?;
        if l.entries == 0 {
            return None;
        }
        Some(l.iterations as f64 / l.entries as f64)
    }

    /// Taken fraction for the branch at `offset`.
    pub fn branch_bias(&self, offset: u32) -> Option<f64> {
        let records = self.records.lock();
        records.branches.get(&offset).map(|b| b.bias())
    }

    /// Dominant type and stability at `offset`.
    pub fn dominant_type(&self, offset: u32) -> Option<(JsType, f64)> {
        let records = self.records.lock();
        records.types.get(&offset).and_then(|t| t.dominant())
    }

    /// Minimum stability over all typed sites (1.0 with no feedback).
    pub fn overall_stability(&self) -> f64 {
        let records = self.records.lock();
        records
            .types
            .values()
            .filter_map(|t| t.dominant().map(|(_, s)| s))
            .fold(1.0, f64::min)
    }

    /// Call-site classification at `offset`.
    pub fn call_site_class(&self, offset: u32) -> Option<CallSiteClass> {
        let records = self.records.lock();
        records.calls.get(&offset).map(|c| c.class())
    }

    /// Most common call target and its count at `offset`.
    pub fn dominant_call_target(&self, offset: u32) -> Option<(u32, u32)> {
        let records = self.records.lock();
        records.calls.get(&offset).and_then(|c| c.dominant_target())
    }

    /// Execution count at the time of the last deopt.
    pub fn last_deopt_execution(&self) -> u32 {
        self.last_deopt_execution.load(Ordering::Relaxed)
    }

    /// Total deopt count.
    pub fn deopt_count(&self) -> u32 {
        self.deopts.load(Ordering::Relaxed)
    }

    /// Snapshot of the deopt ring, oldest first.
    pub fn deopt_history(&self) -> Vec<DeoptRecord> {
        self.records.lock().deopt_ring.clone()
    }

    /// Number of deopts at an offset with a given cause (speculation
    /// blacklisting input).
    pub fn deopt_count_for(&self, offset: u32, reason: DeoptReason) -> u32 {
        self.records
            .lock()
            .deopt_ring
            .iter()
            .filter(|r| r.offset == offset && r.reason == reason)
            .count() as u32
    }

    /// Type hints for the IR builder: dominant type per offset, filtered by a
    /// stability floor.
    pub fn type_hints(&self, min_stability: f64) -> FxHashMap<u32, JsType> {
        let records = self.records.lock();
        records
            .types
            .iter()
            .filter_map(|(&offset, fb)| {
                fb.dominant()
                    .filter(|(_, s)| *s >= min_stability)
                    .map(|(ty, _)| (offset, ty))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_counter() {
        let p = FunctionProfile::new(64);
        assert_eq!(p.record_execution(), 1);
        assert_eq!(p.record_execution(), 2);
        assert_eq!(p.execution_count(), 2);
    }

    #[test]
    fn test_compile_claim_is_exclusive() {
        let p = FunctionProfile::new(64);
        assert!(p
            .compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok());
        assert!(p
            .compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err());
    }

    #[test]
    fn test_mean_iterations() {
        let p = FunctionProfile::new(64);
        p.record_loop_entry(4);
        for _ in 0..10 {
            p.record_back_edge(4);
        }
        p.record_loop_entry(4);
        for _ in 0..20 {
            p.record_back_edge(4);
        }
        assert_eq!(p.mean_iterations(4), Some(15.0));
    }

    #[test]
    fn test_deopt_ring_is_bounded() {
        let p = FunctionProfile::new(64);
        for i in 0..(DEOPT_RING_CAPACITY as u32 + 10) {
            p.record_deopt(i, DeoptReason::ArithmeticOverflow);
        }
        let history = p.deopt_history();
        assert_eq!(history.len(), DEOPT_RING_CAPACITY);
        // Oldest entries were evicted
        assert_eq!(history[0].offset, 10);
    }

    #[test]
    fn test_type_hints_filtered_by_stability() {
        let p = FunctionProfile::new(64);
        for _ in 0..9 {
            p.record_type(0, JsType::Int32);
        }
        p.record_type(0, JsType::String);
        for _ in 0..5 {
            p.record_type(4, JsType::Int32);
            p.record_type(4, JsType::String);
        }
        let hints = p.type_hints(0.8);
        assert_eq!(hints.get(&0), Some(&JsType::Int32));
        assert!(!hints.contains_key(&4)); // 0.5 stability filtered out
    }
}
