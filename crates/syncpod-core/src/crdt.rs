//! Opaque CRDT document.
//!
//! The pod treats storage updates as black-box bytes: the document holds
//! whatever the kernel gives it and never parses update contents itself.
//! The kernel is selected at build time through [`CrdtKernel`]; it must be
//! deterministic, commutative over any delivery order, and idempotent
//! under duplicate apply — those three properties are what make at-least-
//! once cross-pod delivery safe.

use thiserror::Error;

/// Errors from kernel apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// Update bytes did not parse as a kernel update.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
}

/// A conflict-free merge kernel.
///
/// Contract, for any multiset of updates `U`:
///
/// - applying `U` in any order yields the same `snapshot()` bytes
/// - applying any update twice is a no-op the second time
/// - `snapshot()` is itself a valid update that reproduces the full state
///   when applied to an empty kernel
pub trait CrdtKernel: Default + Send + Sync + 'static {
    /// Merge an update into the document state.
    ///
    /// # Errors
    ///
    /// `CrdtError::MalformedUpdate` when the bytes are not a valid update.
    /// The kernel state is unchanged on error.
    fn apply(&mut self, update: &[u8]) -> Result<(), CrdtError>;

    /// Self-contained update representing the full current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Approximate in-memory size in bytes, for metrics and eviction.
    fn size_hint(&self) -> usize;
}

/// Per-room CRDT document: a kernel plus apply accounting.
#[derive(Debug, Default)]
pub struct CrdtDoc<K: CrdtKernel> {
    kernel: K,
    applied: u64,
}

impl<K: CrdtKernel> CrdtDoc<K> {
    /// Empty document.
    #[must_use]
    pub fn new() -> Self {
        Self { kernel: K::default(), applied: 0 }
    }

    /// Merge an update. Delegates entirely to the kernel.
    ///
    /// # Errors
    ///
    /// Propagates [`CrdtError`] from the kernel.
    pub fn apply(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        self.kernel.apply(update)?;
        self.applied += 1;
        Ok(())
    }

    /// Full-state snapshot, itself a valid update.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.kernel.snapshot()
    }

    /// Approximate in-memory size in bytes.
    #[must_use]
    pub fn size_hint(&self) -> usize {
        self.kernel.size_hint()
    }

    /// Number of successful applies since creation.
    #[must_use]
    pub fn applied_count(&self) -> u64 {
        self.applied
    }
}

/// Default kernel: a delta-set merge.
///
/// An update is a sequence of length-prefixed segments
/// (`len:u32 BE | bytes`); the state is the set of all segments ever
/// applied, kept in canonical (lexicographic) order. Merging is set
/// union, so application order cannot matter and duplicates are no-ops.
/// The snapshot is the canonical concatenation of all segments, which is
/// itself an update. Segment contents are never interpreted.
#[derive(Debug, Default)]
pub struct DeltaSetKernel {
    segments: std::collections::BTreeSet<Vec<u8>>,
    bytes: usize,
}

impl DeltaSetKernel {
    /// Encode segments into one update.
    ///
    /// Convenience for producers and tests; the kernel itself only reads
    /// this format.
    #[must_use]
    pub fn encode_update(segments: &[&[u8]]) -> Vec<u8> {
        let total: usize = segments.iter().map(|s| 4 + s.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for segment in segments {
            buf.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            buf.extend_from_slice(segment);
        }
        buf
    }

    fn parse_segments(update: &[u8]) -> Result<Vec<Vec<u8>>, CrdtError> {
        let mut segments = Vec::new();
        let mut rest = update;

        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(CrdtError::MalformedUpdate(format!(
                    "truncated segment length: {} trailing bytes",
                    rest.len()
                )));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];

            if rest.len() < len {
                return Err(CrdtError::MalformedUpdate(format!(
                    "segment claims {len} bytes, {} remain",
                    rest.len()
                )));
            }
            segments.push(rest[..len].to_vec());
            rest = &rest[len..];
        }

        Ok(segments)
    }
}

impl CrdtKernel for DeltaSetKernel {
    fn apply(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        // Parse fully before mutating so a malformed tail cannot leave a
        // half-applied update behind.
        let segments = Self::parse_segments(update)?;

        for segment in segments {
            let len = segment.len();
            if self.segments.insert(segment) {
                self.bytes += len;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bytes + self.segments.len() * 4);
        for segment in &self.segments {
            buf.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            buf.extend_from_slice(segment);
        }
        buf
    }

    fn size_hint(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(data: &[u8]) -> Vec<u8> {
        DeltaSetKernel::encode_update(&[data])
    }

    #[test]
    fn apply_and_snapshot() {
        let mut doc = CrdtDoc::<DeltaSetKernel>::new();
        doc.apply(&update(b"hello")).unwrap();
        doc.apply(&update(b"world")).unwrap();

        let mut replay = CrdtDoc::<DeltaSetKernel>::new();
        replay.apply(&doc.snapshot()).unwrap();
        assert_eq!(replay.snapshot(), doc.snapshot());
    }

    #[test]
    fn order_independent() {
        let u1 = update(b"alpha");
        let u2 = update(b"beta");
        let u3 = update(b"gamma");

        let mut a = CrdtDoc::<DeltaSetKernel>::new();
        let mut b = CrdtDoc::<DeltaSetKernel>::new();

        for u in [&u1, &u2, &u3] {
            a.apply(u).unwrap();
        }
        for u in [&u3, &u1, &u2] {
            b.apply(u).unwrap();
        }

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn duplicate_apply_is_noop() {
        let u = update(b"once");

        let mut doc = CrdtDoc::<DeltaSetKernel>::new();
        doc.apply(&u).unwrap();
        let first = doc.snapshot();

        doc.apply(&u).unwrap();
        assert_eq!(doc.snapshot(), first);
        assert_eq!(doc.size_hint(), b"once".len());
    }

    #[test]
    fn empty_update_is_noop() {
        let mut doc = CrdtDoc::<DeltaSetKernel>::new();
        doc.apply(&[]).unwrap();
        assert!(doc.snapshot().is_empty());
    }

    #[test]
    fn malformed_update_rejected_atomically() {
        let mut doc = CrdtDoc::<DeltaSetKernel>::new();

        // Valid first segment, truncated second: nothing may be applied.
        let mut bad = update(b"ok");
        bad.extend_from_slice(&[0, 0, 0, 10, 1, 2]);

        assert!(matches!(doc.apply(&bad), Err(CrdtError::MalformedUpdate(_))));
        assert!(doc.snapshot().is_empty());
        assert_eq!(doc.applied_count(), 0);
    }

    #[test]
    fn multi_segment_update() {
        let u = DeltaSetKernel::encode_update(&[b"a", b"b", b"c"]);

        let mut doc = CrdtDoc::<DeltaSetKernel>::new();
        doc.apply(&u).unwrap();
        assert_eq!(doc.size_hint(), 3);

        // The snapshot decodes back to the same three segments.
        let mut replay = CrdtDoc::<DeltaSetKernel>::new();
        replay.apply(&doc.snapshot()).unwrap();
        assert_eq!(replay.snapshot(), doc.snapshot());
    }
}
