//! Execution profiler
//!
//! Single source of truth for adaptive decisions. The interpreter reports
//! branches, calls, typed operand kinds, and back-edges; JIT code bumps the
//! same counters through inlined increments. The tier controller and the
//! optimizer read back hotness, branch bias, dominant types, and call-site
//! shapes through the query surface here.

pub mod counters;
pub mod feedback;

use std::sync::Arc;

use dashmap::DashMap;

use crate::ir::types::JsType;

pub use counters::FunctionProfile;
pub use feedback::{CallSiteClass, CallSiteProfile, DeoptRecord, LoopProfile, TypeFeedback};

use crate::ir::instr::DeoptReason;

/// Profiler for one realm.
pub struct Profiler {
    functions: DashMap<u32, Arc<FunctionProfile>>,
    /// Observation-window length for type feedback
    window: usize,
}

impl Profiler {
    /// Create a profiler with the default feedback window.
    pub fn new() -> Self {
        Profiler { functions: DashMap::new(), window: feedback::DEFAULT_WINDOW }
    }

    /// Profile for a function, created on first touch.
    pub fn function(&self, func_index: u32) -> Arc<FunctionProfile> {
        self.functions
            .entry(func_index)
            .or_insert_with(|| Arc::new(FunctionProfile::new(self.window)))
            .clone()
    }

    /// Look up a profile without creating it.
    pub fn try_function(&self, func_index: u32) -> Option<Arc<FunctionProfile>> {
        self.functions.get(&func_index).map(|e| e.clone())
    }

    // ===== Update paths (interpreter + JIT callbacks) =====

    /// Record a function entry; returns the new execution count.
    pub fn record_execution(&self, func_index: u32) -> u32 {
        self.function(func_index).record_execution()
    }

    /// Record a taken back-edge at a loop header; returns the new count.
    pub fn record_back_edge(&self, func_index: u32, header_offset: u32) -> u32 {
        self.function(func_index).record_back_edge(header_offset)
    }

    /// Record a branch outcome.
    pub fn record_branch(&self, func_index: u32, offset: u32, taken: bool) {
        self.function(func_index).record_branch(offset, taken);
    }

    /// Record the observed operand kind at a typed site.
    pub fn record_type(&self, func_index: u32, offset: u32, kind: JsType) {
        self.function(func_index).record_type(offset, kind);
    }

    /// Record a call-site target.
    pub fn record_call(&self, func_index: u32, offset: u32, target: u32) {
        self.function(func_index).record_call(offset, target);
    }

    /// Record a deoptimization event.
    pub fn record_deopt(&self, func_index: u32, offset: u32, reason: DeoptReason) {
        self.function(func_index).record_deopt(offset, reason);
    }

    // ===== Queries =====

    /// Whether a function's execution count has crossed `threshold`.
    pub fn is_function_hot(&self, func_index: u32, threshold: u32) -> bool {
        self.try_function(func_index)
            .map(|p| p.execution_count() >= threshold)
            .unwrap_or(false)
    }

    /// Whether a specific loop's back-edge count has crossed `threshold`.
    pub fn is_loop_hot(&self, func_index: u32, header_offset: u32, threshold: u32) -> bool {
        self.try_function(func_index)
            .map(|p| p.back_edge_count(header_offset) >= threshold)
            .unwrap_or(false)
    }

    /// Fraction of times the branch at `offset` was taken, in [0, 1].
    pub fn branch_bias(&self, func_index: u32, offset: u32) -> Option<f64> {
        self.try_function(func_index)?.branch_bias(offset)
    }

    /// Dominant observed type and its stability at an offset.
    pub fn dominant_type(&self, func_index: u32, offset: u32) -> Option<(JsType, f64)> {
        self.try_function(func_index)?.dominant_type(offset)
    }

    /// Call-site shape at an offset.
    pub fn call_site_class(&self, func_index: u32, offset: u32) -> Option<CallSiteClass> {
        self.try_function(func_index)?.call_site_class(offset)
    }

    /// Minimum stability across all typed sites with feedback; 1.0 when the
    /// function has no typed sites yet.
    pub fn overall_stability(&self, func_index: u32) -> f64 {
        self.try_function(func_index)
            .map(|p| p.overall_stability())
            .unwrap_or(1.0)
    }

    /// Whether the function has stayed hot without deoptimizing for at least
    /// `quiet_executions` since its last deopt.
    pub fn sustained_hot(&self, func_index: u32, threshold: u32, quiet_executions: u32) -> bool {
        match self.try_function(func_index) {
            Some(p) => {
                let exec = p.execution_count();
                exec >= threshold && exec.saturating_sub(p.last_deopt_execution()) >= quiet_executions
            }
            None => false,
        }
    }

    /// Recent deoptimization records for a function, newest last.
    pub fn deopt_history(&self, func_index: u32) -> Vec<DeoptRecord> {
        self.try_function(func_index)
            .map(|p| p.deopt_history())
            .unwrap_or_default()
    }

    /// Total functions with any profile data.
    pub fn profiled_function_count(&self) -> usize {
        self.functions.len()
    }

    /// Sum of all recorded deoptimizations.
    pub fn total_deopts(&self) -> u64 {
        self.functions
            .iter()
            .map(|e| e.value().deopt_count() as u64)
            .sum()
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hotness_query() {
        let p = Profiler::new();
        assert!(!p.is_function_hot(0, 10));
        for _ in 0..10 {
            p.record_execution(0);
        }
        assert!(p.is_function_hot(0, 10));
        assert!(!p.is_function_hot(0, 11));
    }

    #[test]
    fn test_loop_hotness_is_per_header() {
        let p = Profiler::new();
        for _ in 0..100 {
            p.record_back_edge(0, 8);
        }
        assert!(p.is_loop_hot(0, 8, 100));
        assert!(!p.is_loop_hot(0, 16, 1));
    }

    #[test]
    fn test_branch_bias() {
        let p = Profiler::new();
        for i in 0..10 {
            p.record_branch(0, 4, i < 9);
        }
        let bias = p.branch_bias(0, 4).unwrap();
        assert!((bias - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_type_and_stability() {
        let p = Profiler::new();
        for _ in 0..8 {
            p.record_type(0, 2, JsType::Int32);
        }
        for _ in 0..2 {
            p.record_type(0, 2, JsType::String);
        }
        let (ty, stability) = p.dominant_type(0, 2).unwrap();
        assert_eq!(ty, JsType::Int32);
        assert!((stability - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_sustained_hot_resets_on_deopt() {
        let p = Profiler::new();
        for _ in 0..1000 {
            p.record_execution(7);
        }
        assert!(p.sustained_hot(7, 500, 100));
        p.record_deopt(7, 0, DeoptReason::TypeInstability);
        assert!(!p.sustained_hot(7, 500, 100));
        for _ in 0..100 {
            p.record_execution(7);
        }
        assert!(p.sustained_hot(7, 500, 100));
    }
}
