//! In-memory op store for tests and simulation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{OpRecord, OpStore, OpStoreError};

/// In-memory [`OpStore`].
///
/// Clones share state through an `Arc`, which is also how multi-pod
/// tests model a store shared by a cluster. The mutex serializes
/// appends, making sequence assignment contention-safe the same way the
/// durable backend's write transactions do.
///
/// # Panics
///
/// Operations panic if the mutex is poisoned. Acceptable for
/// test/simulation code.
#[derive(Clone, Default)]
pub struct MemoryOpStore {
    inner: Arc<Mutex<HashMap<String, Vec<OpRecord>>>>,
}

impl MemoryOpStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total ops across all rooms (test hook).
    pub fn total_ops(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").values().map(Vec::len).sum()
    }
}

impl OpStore for MemoryOpStore {
    fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
        ts: u64,
    ) -> Result<u64, OpStoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let ops = inner.entry(room_id.to_string()).or_default();

        // Every clone shares this one vec under one mutex, so the tail
        // cannot diverge and `Conflict` is unreachable here; the durable
        // backend carries the split-brain guard.
        let seq = ops.last().map_or(1, |last| last.seq + 1);
        ops.push(OpRecord {
            room_id: room_id.to_string(),
            seq,
            site_id: site_id.to_string(),
            bytes: bytes.to_vec(),
            ts,
        });

        Ok(seq)
    }

    fn range_scan(
        &self,
        room_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<OpRecord>, OpStoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");

        Ok(inner
            .get(room_id)
            .map(|ops| {
                ops.iter().filter(|op| op.seq > from_seq).take(limit).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn latest_seq(&self, room_id: &str) -> Result<Option<u64>, OpStoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.get(room_id).and_then(|ops| ops.last().map(|op| op.seq)))
    }

    fn truncate_before(&self, room_id: &str, before_seq: u64) -> Result<u64, OpStoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");

        let Some(ops) = inner.get_mut(room_id) else {
            return Ok(0);
        };
        let before = ops.len();
        ops.retain(|op| op.seq >= before_seq);
        Ok((before - ops.len()) as u64)
    }

    fn ping(&self) -> Result<(), OpStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_assign_dense_sequences_from_one() {
        let store = MemoryOpStore::new();

        for i in 0..3 {
            let seq = store.append("R", "pod-a", &[i], 100 + u64::from(i)).unwrap();
            assert_eq!(seq, u64::from(i) + 1);
        }

        assert_eq!(store.latest_seq("R").unwrap(), Some(3));
        assert_eq!(store.latest_seq("other").unwrap(), None);
    }

    #[test]
    fn rooms_are_independent() {
        let store = MemoryOpStore::new();
        store.append("A", "p", b"1", 0).unwrap();
        store.append("B", "p", b"1", 0).unwrap();
        store.append("A", "p", b"2", 0).unwrap();

        assert_eq!(store.latest_seq("A").unwrap(), Some(2));
        assert_eq!(store.latest_seq("B").unwrap(), Some(1));
    }

    #[test]
    fn range_scan_is_exclusive_and_ordered() {
        let store = MemoryOpStore::new();
        for i in 0..5u8 {
            store.append("R", "p", &[i], 0).unwrap();
        }

        let all = store.range_scan("R", 0, 100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].seq, 1);

        let tail = store.range_scan("R", 3, 100).unwrap();
        assert_eq!(tail.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![4, 5]);

        let page = store.range_scan("R", 0, 2).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn read_your_writes() {
        let store = MemoryOpStore::new();
        let seq = store.append("R", "p", b"op", 42).unwrap();

        let scanned = store.range_scan("R", seq - 1, 1).unwrap();
        assert_eq!(scanned[0].bytes, b"op");
        assert_eq!(scanned[0].ts, 42);
        assert_eq!(scanned[0].site_id, "p");
    }

    #[test]
    fn truncate_drops_prefix_only() {
        let store = MemoryOpStore::new();
        for i in 0..5u8 {
            store.append("R", "p", &[i], 0).unwrap();
        }

        let removed = store.truncate_before("R", 3).unwrap();
        assert_eq!(removed, 2);

        let rest = store.range_scan("R", 0, 100).unwrap();
        assert_eq!(rest.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        // Sequences keep growing from the old tail.
        assert_eq!(store.append("R", "p", b"next", 0).unwrap(), 6);
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryOpStore::new();
        let clone = store.clone();

        store.append("R", "p", b"op", 0).unwrap();
        assert_eq!(clone.latest_seq("R").unwrap(), Some(1));
    }
}
