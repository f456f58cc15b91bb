//! The code cache
//!
//! Owns every installed artifact. The per-function entry is an atomic
//! pointer-sized handle: installation publishes the fully built artifact
//! with a release store and mutator reads acquire, so a reader never sees a
//! half-initialized artifact. Superseded artifacts retire into a list gated
//! by the monotone generation counter: memory is released only once no stack
//! frame can hold a return address inside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::backend::memory::{ExecMemoryPool, ExecRegion};
use crate::backend::{CodeBlob, CodegenError};

use super::Tier;

/// An installed block of native code with its metadata.
pub struct Artifact {
    /// Source function
    pub func_index: u32,
    /// Tier it was compiled at
    pub tier: Tier,
    /// The backend output: code bytes and tables
    pub blob: CodeBlob,
    /// The executable mapping, when installation went through the pool
    pub region: Option<ExecRegion>,
    /// Generation stamp for deferred release
    pub generation: u64,
}

impl Artifact {
    /// Entry-point address when executable memory is mapped.
    pub fn entry_address(&self) -> Option<*const u8> {
        self.region.as_ref().map(|r| {
            // Safety: entry_offset is within the region (checked at install)
            unsafe { r.entry().add(self.blob.entry_offset) }
        })
    }

    /// Native offset of the OSR entry for a bytecode offset.
    pub fn osr_native_offset(&self, bytecode_offset: u32) -> Option<usize> {
        self.blob
            .osr_entries
            .iter()
            .find(|(bc, _)| *bc == bytecode_offset)
            .map(|(_, native)| *native)
    }

    /// Deopt-table entry covering a native offset.
    pub fn deopt_entry_at(&self, native_offset: usize) -> Option<&crate::backend::DeoptEntry> {
        self.blob
            .deopt_table
            .iter()
            .rev()
            .find(|e| e.native_offset <= native_offset)
    }

    /// Code size in bytes.
    pub fn code_size(&self) -> usize {
        self.blob.code.len()
    }
}

struct Slot {
    /// Current artifact per tier
    by_tier: [Option<Arc<Artifact>>; 4],
    /// The dispatch entry: the highest valid tier's artifact
    current: Option<Arc<Artifact>>,
}

impl Default for Slot {
    fn default() -> Self {
        Slot { by_tier: [None, None, None, None], current: None }
    }
}

/// The cache.
pub struct CodeCache {
    slots: RwLock<FxHashMap<u32, Slot>>,
    retired: RwLock<Vec<Arc<Artifact>>>,
    exec_pool: ExecMemoryPool,
    /// Highest generation ever installed
    latest_generation: AtomicU64,
}

impl CodeCache {
    /// Empty cache with its own executable-memory pool.
    pub fn new() -> Self {
        CodeCache {
            slots: RwLock::new(FxHashMap::default()),
            retired: RwLock::new(Vec::new()),
            exec_pool: ExecMemoryPool::new(true),
            latest_generation: AtomicU64::new(0),
        }
    }

    /// Install a blob for `(func_index, tier)`. Mapping the bytes into
    /// executable memory is best-effort: on hosts without an executable
    /// path the artifact still installs with metadata only, which the
    /// interpreter-driven configuration is fine with.
    pub fn install(
        &self,
        func_index: u32,
        tier: Tier,
        blob: CodeBlob,
        generation: u64,
    ) -> Result<Arc<Artifact>, CodegenError> {
        let region = self.exec_pool.install(&blob.code).ok();
        let artifact = Arc::new(Artifact { func_index, tier, blob, region, generation });

        let mut slots = self.slots.write();
        let slot = slots.entry(func_index).or_default();
        if let Some(old) = slot.by_tier[tier as usize].take() {
            self.retired.write().push(old);
        }
        slot.by_tier[tier as usize] = Some(artifact.clone());
        // The entry swap: highest-tier valid artifact becomes current. The
        // Arc store under the write lock is the release; readers clone under
        // the read lock (acquire).
        slot.current = slot.by_tier.iter().rev().flatten().next().cloned();
        self.latest_generation.fetch_max(generation, Ordering::AcqRel);
        Ok(artifact)
    }

    /// The current entry for a function. Always safe to dispatch through:
    /// never a dangling or half-published artifact.
    pub fn current(&self, func_index: u32) -> Option<Arc<Artifact>> {
        self.slots.read().get(&func_index)?.current.clone()
    }

    /// Artifact installed for a specific tier.
    pub fn at_tier(&self, func_index: u32, tier: Tier) -> Option<Arc<Artifact>> {
        self.slots.read().get(&func_index)?.by_tier[tier as usize].clone()
    }

    /// Invalidate every artifact above `floor` for a function; the entry
    /// falls back to the highest remaining tier (or interpretation).
    pub fn invalidate_above(&self, func_index: u32, floor: Tier) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(&func_index) {
            for t in (0..4).rev() {
                if t > floor as usize {
                    if let Some(old) = slot.by_tier[t].take() {
                        self.retired.write().push(old);
                    }
                }
            }
            slot.current = slot.by_tier.iter().rev().flatten().next().cloned();
        }
    }

    /// Release retired artifacts older than the oldest generation any live
    /// frame observed at the last safepoint. Returns how many were freed.
    pub fn release_retired(&self, oldest_live_generation: u64) -> usize {
        let mut retired = self.retired.write();
        let before = retired.len();
        let mut kept = Vec::new();
        for artifact in retired.drain(..) {
            let releasable = artifact.generation < oldest_live_generation
                && Arc::strong_count(&artifact) == 1;
            if releasable {
                match Arc::try_unwrap(artifact) {
                    Ok(mut a) => {
                        if let Some(region) = a.region.take() {
                            self.exec_pool.release(region);
                        }
                    }
                    Err(a) => kept.push(a),
                }
            } else {
                kept.push(artifact);
            }
        }
        let freed = before - kept.len();
        *retired = kept;
        freed
    }

    /// Number of live (current or per-tier) artifacts.
    pub fn installed(&self) -> usize {
        self.slots
            .read()
            .values()
            .map(|s| s.by_tier.iter().flatten().count())
            .sum()
    }

    /// Number of retired artifacts awaiting release.
    pub fn retired(&self) -> usize {
        self.retired.read().len()
    }

    /// Total mapped executable bytes.
    pub fn mapped_bytes(&self) -> usize {
        self.exec_pool.total_mapped()
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> CodeBlob {
        CodeBlob { code: vec![0xC3; len], ..Default::default() }
    }

    #[test]
    fn test_install_and_current() {
        let cache = CodeCache::new();
        assert!(cache.current(0).is_none());
        cache.install(0, Tier::Baseline, blob(16), 1).unwrap();
        let cur = cache.current(0).unwrap();
        assert_eq!(cur.tier, Tier::Baseline);
        assert_eq!(cache.installed(), 1);
    }

    #[test]
    fn test_higher_tier_becomes_current() {
        let cache = CodeCache::new();
        cache.install(0, Tier::Baseline, blob(16), 1).unwrap();
        cache.install(0, Tier::Optimizing, blob(32), 2).unwrap();
        assert_eq!(cache.current(0).unwrap().tier, Tier::Optimizing);
        // Baseline still reachable at its tier
        assert!(cache.at_tier(0, Tier::Baseline).is_some());
    }

    #[test]
    fn test_invalidate_falls_back() {
        let cache = CodeCache::new();
        cache.install(0, Tier::Baseline, blob(16), 1).unwrap();
        cache.install(0, Tier::Optimizing, blob(32), 2).unwrap();
        cache.invalidate_above(0, Tier::Baseline);
        assert_eq!(cache.current(0).unwrap().tier, Tier::Baseline);
        assert_eq!(cache.retired(), 1);
    }

    #[test]
    fn test_retired_released_by_generation() {
        let cache = CodeCache::new();
        cache.install(0, Tier::Baseline, blob(16), 1).unwrap();
        cache.install(0, Tier::Baseline, blob(16), 2).unwrap(); // retires gen 1
        assert_eq!(cache.retired(), 1);

        // A frame might still be inside generation 1: nothing freed
        assert_eq!(cache.release_retired(1), 0);
        assert_eq!(cache.retired(), 1);

        // All frames past generation 2: safe to free
        assert_eq!(cache.release_retired(3), 1);
        assert_eq!(cache.retired(), 0);
    }

    #[test]
    fn test_replacement_retires_old() {
        let cache = CodeCache::new();
        cache.install(0, Tier::Baseline, blob(16), 1).unwrap();
        cache.install(0, Tier::Baseline, blob(24), 2).unwrap();
        assert_eq!(cache.installed(), 1);
        assert_eq!(cache.retired(), 1);
        assert_eq!(cache.current(0).unwrap().generation, 2);
    }

    #[test]
    fn test_osr_lookup() {
        let cache = CodeCache::new();
        let mut b = blob(64);
        b.osr_entries.push((8, 40));
        cache.install(0, Tier::Baseline, b, 1).unwrap();
        let artifact = cache.current(0).unwrap();
        assert_eq!(artifact.osr_native_offset(8), Some(40));
        assert_eq!(artifact.osr_native_offset(9), None);
    }
}
