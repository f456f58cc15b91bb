//! Feedback record types: type observations, branches, call sites, loops

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::ir::instr::DeoptReason;
use crate::ir::types::JsType;

/// Default sliding-window length for type feedback.
pub const DEFAULT_WINDOW: usize = 64;

/// Capacity of the per-function deopt ring buffer.
pub const DEOPT_RING_CAPACITY: usize = 32;

/// Call-site targets tracked before a site is declared megamorphic.
const MAX_TRACKED_TARGETS: usize = 8;

/// Taken / not-taken counters for one branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchCounters {
    /// Times the branch was taken
    pub taken: u32,
    /// Times it fell through
    pub not_taken: u32,
}

impl BranchCounters {
    /// Taken fraction in [0, 1]; 0.5 before any observation.
    pub fn bias(&self) -> f64 {
        let total = self.taken + self.not_taken;
        if total == 0 {
            return 0.5;
        }
        self.taken as f64 / total as f64
    }
}

/// Multiset of observed kinds over the last N observations.
#[derive(Debug, Clone)]
pub struct TypeFeedback {
    window: usize,
    recent: VecDeque<JsType>,
    counts: FxHashMap<JsType, u32>,
}

impl TypeFeedback {
    /// Feedback record holding at most `window` observations.
    pub fn new(window: usize) -> Self {
        TypeFeedback {
            window,
            recent: VecDeque::with_capacity(window),
            counts: FxHashMap::default(),
        }
    }

    /// Record one observation, evicting the oldest past the window.
    pub fn observe(&mut self, kind: JsType) {
        if self.recent.len() == self.window {
            if let Some(old) = self.recent.pop_front() {
                if let Some(c) = self.counts.get_mut(&old) {
                    *c = c.saturating_sub(1);
                    if *c == 0 {
                        self.counts.remove(&old);
                    }
                }
            }
        }
        self.recent.push_back(kind);
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    /// Dominant kind and its stability `max_count / total ∈ [0, 1]`.
    pub fn dominant(&self) -> Option<(JsType, f64)> {
        let total = self.recent.len();
        if total == 0 {
            return None;
        }
        let (&kind, &count) = self.counts.iter().max_by_key(|(_, &c)| c)?;
        Some((kind, count as f64 / total as f64))
    }

    /// Number of distinct kinds currently in the window.
    pub fn kind_count(&self) -> usize {
        self.counts.len()
    }
}

/// Mono / poly / megamorphic classification of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteClass {
    /// Exactly one target observed
    Monomorphic,
    /// Two to four targets
    Polymorphic,
    /// More than four targets
    Megamorphic,
}

/// Observed targets of one call site.
#[derive(Debug, Clone, Default)]
pub struct CallSiteProfile {
    /// Total calls through this site
    pub total: u32,
    /// target function → count (bounded; overflow targets only bump `total`)
    pub targets: FxHashMap<u32, u32>,
}

impl CallSiteProfile {
    /// Record one call to `target`.
    pub fn observe(&mut self, target: u32) {
        self.total += 1;
        if self.targets.len() < MAX_TRACKED_TARGETS || self.targets.contains_key(&target) {
            *self.targets.entry(target).or_insert(0) += 1;
        }
    }

    /// Most common target and its count.
    pub fn dominant_target(&self) -> Option<(u32, u32)> {
        self.targets.iter().map(|(&t, &c)| (t, c)).max_by_key(|&(_, c)| c)
    }

    /// Shape classification: 1 target → mono, 2–4 → poly, >4 → megamorphic.
    pub fn class(&self) -> CallSiteClass {
        match self.targets.len() {
            0 | 1 => CallSiteClass::Monomorphic,
            2..=4 => CallSiteClass::Polymorphic,
            _ => CallSiteClass::Megamorphic,
        }
    }
}

/// Executions of a loop header.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopProfile {
    /// Times the loop was entered from outside
    pub entries: u64,
    /// Total header executions (back-edges taken)
    pub iterations: u64,
}

/// One deoptimization event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptRecord {
    /// Bytecode offset of the failed guard
    pub offset: u32,
    /// Cause
    pub reason: DeoptReason,
    /// Monotone sequence number within the function
    pub seq: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_feedback_window_eviction() {
        let mut fb = TypeFeedback::new(4);
        for _ in 0..4 {
            fb.observe(JsType::Int32);
        }
        let (ty, s) = fb.dominant().unwrap();
        assert_eq!(ty, JsType::Int32);
        assert_eq!(s, 1.0);

        // Push the window full of strings; int32 observations age out
        for _ in 0..4 {
            fb.observe(JsType::String);
        }
        let (ty, s) = fb.dominant().unwrap();
        assert_eq!(ty, JsType::String);
        assert_eq!(s, 1.0);
        assert_eq!(fb.kind_count(), 1);
    }

    #[test]
    fn test_branch_bias_default() {
        let b = BranchCounters::default();
        assert_eq!(b.bias(), 0.5);
    }

    #[test]
    fn test_call_site_classification() {
        let mut site = CallSiteProfile::default();
        site.observe(1);
        assert_eq!(site.class(), CallSiteClass::Monomorphic);
        site.observe(2);
        assert_eq!(site.class(), CallSiteClass::Polymorphic);
        for t in 3..=5 {
            site.observe(t);
        }
        assert_eq!(site.class(), CallSiteClass::Megamorphic);
    }

    #[test]
    fn test_dominant_call_target() {
        let mut site = CallSiteProfile::default();
        for _ in 0..5 {
            site.observe(7);
        }
        site.observe(9);
        assert_eq!(site.dominant_target(), Some((7, 5)));
    }
}
