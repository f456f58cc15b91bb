//! Forward-branch fixups
//!
//! All three backends share the protocol: a forward branch is emitted with a
//! zeroed offset and recorded as pending; defining a label patches every
//! pending reference to it; at the end of emission every reference must be
//! resolved. Each record carries the instruction kind's reachable range so
//! patching can reject (or long-form) out-of-range targets instead of
//! truncating them.

use rustc_hash::FxHashMap;

use super::CodegenError;

/// A label to be bound to a code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// How a pending reference is patched, supplied by the owning backend.
pub trait PatchKind {
    /// Signed reach in bytes from the branch site (± range).
    fn range(&self) -> i64;
    /// Write `offset` (target − site, in bytes) into the bytes at `site`.
    fn patch(&self, code: &mut [u8], site: usize, offset: i64);
}

/// One unresolved reference.
struct Pending<K> {
    site: usize,
    label: Label,
    kind: K,
}

/// Label table plus pending-reference list for one function's emission.
pub struct FixupSink<K: PatchKind> {
    bound: FxHashMap<Label, usize>,
    pending: Vec<Pending<K>>,
    next_label: u32,
}

impl<K: PatchKind> FixupSink<K> {
    /// Empty sink.
    pub fn new() -> Self {
        FixupSink { bound: FxHashMap::default(), pending: Vec::new(), next_label: 0 }
    }

    /// Allocate a fresh label.
    pub fn fresh(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Offset of a bound label.
    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.bound.get(&label).copied()
    }

    /// Record a reference at `site` (offset of the branch instruction) to a
    /// label; if the label is already bound the caller patches immediately
    /// via the returned offset.
    pub fn use_label(
        &mut self,
        code: &mut [u8],
        site: usize,
        label: Label,
        kind: K,
    ) -> Result<(), CodegenError> {
        match self.bound.get(&label) {
            Some(&target) => apply(code, site, target, &kind),
            None => {
                self.pending.push(Pending { site, label, kind });
                Ok(())
            }
        }
    }

    /// Bind `label` to `offset`, patching every pending reference to it.
    pub fn bind(
        &mut self,
        code: &mut [u8],
        label: Label,
        offset: usize,
    ) -> Result<(), CodegenError> {
        self.bound.insert(label, offset);
        let mut remaining = Vec::new();
        for p in self.pending.drain(..) {
            if p.label == label {
                apply(code, p.site, offset, &p.kind)?;
            } else {
                remaining.push(p);
            }
        }
        self.pending = remaining;
        Ok(())
    }

    /// End of emission: everything must be resolved.
    pub fn finish(&self) -> Result<(), CodegenError> {
        match self.pending.first() {
            Some(p) => Err(CodegenError::UnresolvedLabel(p.label.0)),
            None => Ok(()),
        }
    }
}

impl<K: PatchKind> Default for FixupSink<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn apply<K: PatchKind>(
    code: &mut [u8],
    site: usize,
    target: usize,
    kind: &K,
) -> Result<(), CodegenError> {
    let offset = target as i64 - site as i64;
    let range = kind.range();
    if offset > range || offset < -range {
        return Err(CodegenError::EncodingRangeExceeded { site, target });
    }
    kind.patch(code, site, offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4-byte little-endian rel32 at site+1 (x86-style), ±2 GiB.
    struct Rel32;
    impl PatchKind for Rel32 {
        fn range(&self) -> i64 {
            i32::MAX as i64
        }
        fn patch(&self, code: &mut [u8], site: usize, offset: i64) {
            // Displacement is relative to the end of the 5-byte instruction
            let disp = (offset - 5) as i32;
            code[site + 1..site + 5].copy_from_slice(&disp.to_le_bytes());
        }
    }

    /// Tiny reach for range tests.
    struct Short;
    impl PatchKind for Short {
        fn range(&self) -> i64 {
            16
        }
        fn patch(&self, code: &mut [u8], site: usize, offset: i64) {
            code[site] = offset as u8;
        }
    }

    #[test]
    fn test_forward_reference_patched_on_bind() {
        let mut code = vec![0u8; 32];
        let mut sink: FixupSink<Rel32> = FixupSink::new();
        let l = sink.fresh();
        sink.use_label(&mut code, 0, l, Rel32).unwrap();
        assert!(sink.finish().is_err());
        sink.bind(&mut code, l, 15).unwrap();
        assert!(sink.finish().is_ok());
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp, 10); // 15 - (0 + 5)
    }

    #[test]
    fn test_backward_reference_patched_immediately() {
        let mut code = vec![0u8; 32];
        let mut sink: FixupSink<Rel32> = FixupSink::new();
        let l = sink.fresh();
        sink.bind(&mut code, l, 2).unwrap();
        sink.use_label(&mut code, 10, l, Rel32).unwrap();
        let disp = i32::from_le_bytes(code[11..15].try_into().unwrap());
        assert_eq!(disp, -13); // 2 - (10 + 5)
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut code = vec![0u8; 64];
        let mut sink: FixupSink<Short> = FixupSink::new();
        let l = sink.fresh();
        sink.use_label(&mut code, 0, l, Short).unwrap();
        let err = sink.bind(&mut code, l, 40).unwrap_err();
        assert!(matches!(err, CodegenError::EncodingRangeExceeded { site: 0, target: 40 }));
    }

    #[test]
    fn test_unresolved_label_reported() {
        let mut code = vec![0u8; 8];
        let mut sink: FixupSink<Short> = FixupSink::new();
        let l = sink.fresh();
        sink.use_label(&mut code, 0, l, Short).unwrap();
        assert!(matches!(sink.finish(), Err(CodegenError::UnresolvedLabel(0))));
    }
}
