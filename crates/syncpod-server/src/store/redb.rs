//! Redb-backed durable op store.
//!
//! Uses redb's ACID copy-on-write transactions: `append` commits before
//! returning, so a crash can lose at most ops that were never
//! acknowledged. Write transactions are serialized by redb, which makes
//! the read-latest/insert-next sequence assignment atomic.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{OpRecord, OpStore, OpStoreError};

/// Table: ops
/// Key: `(room_id, seq)` — redb tuple ordering groups each room's ops
/// contiguously in seq order.
/// Value: CBOR-encoded [`StoredOp`].
const OPS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("ops");

/// Value payload for one op (the key already carries room and seq).
#[derive(Debug, Serialize, Deserialize)]
struct StoredOp {
    site_id: String,
    bytes: Vec<u8>,
    ts: u64,
}

/// Durable [`OpStore`] backed by redb. Clone is cheap (`Arc`).
#[derive(Clone)]
pub struct RedbOpStore {
    db: Arc<Database>,
}

impl RedbOpStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// `OpStoreError::Unavailable` if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpStoreError> {
        let db = Database::create(path.as_ref()).map_err(unavailable)?;

        let txn = db.begin_write().map_err(unavailable)?;
        {
            let _ = txn.open_table(OPS).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn latest_in<T: ReadableTable<(&'static str, u64), &'static [u8]>>(
        table: &T,
        room_id: &str,
    ) -> Result<Option<u64>, OpStoreError> {
        let mut range =
            table.range((room_id, 0u64)..=(room_id, u64::MAX)).map_err(unavailable)?;

        match range.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(unavailable)?;
                Ok(Some(key.value().1))
            },
            None => Ok(None),
        }
    }
}

impl OpStore for RedbOpStore {
    fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
        ts: u64,
    ) -> Result<u64, OpStoreError> {
        let txn = self.db.begin_write().map_err(unavailable)?;

        let outcome = {
            let mut table = txn.open_table(OPS).map_err(unavailable)?;

            let seq = Self::latest_in(&table, room_id)?.map_or(1, |latest| latest + 1);

            let stored = StoredOp { site_id: site_id.to_string(), bytes: bytes.to_vec(), ts };
            let mut value = Vec::with_capacity(bytes.len() + 64);
            ciborium::into_writer(&stored, &mut value)
                .map_err(|e| OpStoreError::Serialization(e.to_string()))?;

            // A record already at the freshly assigned sequence means
            // another writer owns this room's tail (the latest-scan and
            // this insert are one transaction, so no local race can put
            // it there). Abort instead of overwriting history.
            let occupied =
                table.insert((room_id, seq), value.as_slice()).map_err(unavailable)?.is_some();

            if occupied {
                let expected = Self::latest_in(&table, room_id)?.map_or(1, |latest| latest + 1);
                Err(OpStoreError::Conflict { expected, got: seq })
            } else {
                Ok(seq)
            }
        };

        match outcome {
            Ok(seq) => {
                txn.commit().map_err(unavailable)?;
                Ok(seq)
            },
            Err(err) => {
                txn.abort().map_err(unavailable)?;
                Err(err)
            },
        }
    }

    fn range_scan(
        &self,
        room_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<OpRecord>, OpStoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(OPS).map_err(unavailable)?;

        let start = from_seq.saturating_add(1);
        let range = table.range((room_id, start)..=(room_id, u64::MAX)).map_err(unavailable)?;

        let mut ops = Vec::new();
        for result in range {
            if ops.len() >= limit {
                break;
            }

            let (key, value) = result.map_err(unavailable)?;
            let (_, seq) = key.value();

            let stored: StoredOp = ciborium::from_reader(value.value())
                .map_err(|e| OpStoreError::Serialization(e.to_string()))?;

            ops.push(OpRecord {
                room_id: room_id.to_string(),
                seq,
                site_id: stored.site_id,
                bytes: stored.bytes,
                ts: stored.ts,
            });
        }

        Ok(ops)
    }

    fn latest_seq(&self, room_id: &str) -> Result<Option<u64>, OpStoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(OPS).map_err(unavailable)?;

        Self::latest_in(&table, room_id)
    }

    fn truncate_before(&self, room_id: &str, before_seq: u64) -> Result<u64, OpStoreError> {
        let txn = self.db.begin_write().map_err(unavailable)?;

        let removed = {
            let mut table = txn.open_table(OPS).map_err(unavailable)?;

            let stale: Vec<u64> = {
                let range = table
                    .range((room_id, 0u64)..(room_id, before_seq))
                    .map_err(unavailable)?;

                let mut seqs = Vec::new();
                for result in range {
                    let (key, _) = result.map_err(unavailable)?;
                    seqs.push(key.value().1);
                }
                seqs
            };

            for seq in &stale {
                table.remove((room_id, *seq)).map_err(unavailable)?;
            }
            stale.len() as u64
        };

        txn.commit().map_err(unavailable)?;

        Ok(removed)
    }

    fn ping(&self) -> Result<(), OpStoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        txn.open_table(OPS).map_err(unavailable)?;
        Ok(())
    }
}

fn unavailable(err: impl std::fmt::Display) -> OpStoreError {
    OpStoreError::Unavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> RedbOpStore {
        RedbOpStore::open(dir.path().join("ops.redb")).unwrap()
    }

    #[test]
    fn append_assigns_sequences_from_one() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.append("R", "pod-a", b"op1", 10).unwrap(), 1);
        assert_eq!(store.append("R", "pod-a", b"op2", 11).unwrap(), 2);
        assert_eq!(store.latest_seq("R").unwrap(), Some(2));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.redb");

        {
            let store = RedbOpStore::open(&path).unwrap();
            store.append("R", "pod-a", b"op1", 10).unwrap();
            store.append("R", "pod-a", b"op2", 11).unwrap();
        }

        let store = RedbOpStore::open(&path).unwrap();
        assert_eq!(store.latest_seq("R").unwrap(), Some(2));
        assert_eq!(store.append("R", "pod-b", b"op3", 12).unwrap(), 3);

        let ops = store.range_scan("R", 0, 100).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].bytes, b"op1");
        assert_eq!(ops[2].site_id, "pod-b");
    }

    #[test]
    fn rooms_do_not_interleave() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.append("alpha", "p", b"a1", 0).unwrap();
        store.append("beta", "p", b"b1", 0).unwrap();
        store.append("alpha", "p", b"a2", 0).unwrap();

        let alpha = store.range_scan("alpha", 0, 100).unwrap();
        assert_eq!(alpha.iter().map(|op| op.bytes.as_slice()).collect::<Vec<_>>(), vec![
            b"a1".as_slice(),
            b"a2".as_slice()
        ]);
        assert_eq!(store.latest_seq("beta").unwrap(), Some(1));
    }

    #[test]
    fn range_scan_pagination() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..10u8 {
            store.append("R", "p", &[i], 0).unwrap();
        }

        let first = store.range_scan("R", 0, 4).unwrap();
        assert_eq!(first.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let next = store.range_scan("R", 4, 4).unwrap();
        assert_eq!(next.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![5, 6, 7, 8]);

        let last = store.range_scan("R", 8, 4).unwrap();
        assert_eq!(last.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![9, 10]);
    }

    #[test]
    fn truncate_before_compacts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..6u8 {
            store.append("R", "p", &[i], 0).unwrap();
        }

        assert_eq!(store.truncate_before("R", 4).unwrap(), 3);

        let rest = store.range_scan("R", 0, 100).unwrap();
        assert_eq!(rest.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![4, 5, 6]);

        // New appends continue after the surviving tail.
        assert_eq!(store.append("R", "p", b"x", 0).unwrap(), 7);
    }

    #[test]
    fn ping_reports_healthy() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.ping().is_ok());
    }
}
