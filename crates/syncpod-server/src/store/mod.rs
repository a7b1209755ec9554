//! Durable op store.
//!
//! Append-only CRDT op history, partitioned by room. The store — not the
//! caller — assigns each op its per-room sequence, atomically under the
//! store's own serialization, so sequences are contention-safe and
//! nothing upstream can fabricate one. `append` returns only once the
//! record is durable; the pod never applies an op to an in-memory
//! document before that return (durable-before-apply). Read-your-writes
//! holds per room.
//!
//! Sequences start at 1; `range_scan(room, 0)` therefore replays a whole
//! room, which is exactly what cold activation does.

mod chaotic;
mod memory;
mod redb;

pub use chaotic::ChaoticOpStore;
pub use memory::MemoryOpStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::redb::RedbOpStore;

/// One durably stored CRDT op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRecord {
    /// Room the op belongs to.
    pub room_id: String,
    /// Store-assigned per-room sequence, starting at 1.
    pub seq: u64,
    /// Pod that accepted the op.
    pub site_id: String,
    /// Opaque CRDT update bytes.
    pub bytes: Vec<u8>,
    /// Wall-clock ms at append time.
    pub ts: u64,
}

/// Errors from op store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpStoreError {
    /// Store unreachable or I/O failed. Retryable with backoff; storage
    /// ingress is refused as `TemporarilyReadOnly` while it lasts.
    #[error("op store unavailable: {0}")]
    Unavailable(String),

    /// Record failed to encode or decode.
    #[error("op store serialization error: {0}")]
    Serialization(String),

    /// The freshly assigned sequence was already occupied: another
    /// writer owns this room's tail (split-brain — e.g. two pods pointed
    /// at restored copies of the same store). Nothing was written; a
    /// retry re-reads the tail and assigns past the foreign records.
    #[error("op sequence conflict: expected {expected}, got {got}")]
    Conflict {
        /// Next free sequence after the records actually present
        expected: u64,
        /// Sequence this append tried to occupy
        got: u64,
    },
}

/// Storage abstraction for the op history.
///
/// Implementations are `Clone + Send + Sync` and share state through an
/// inner `Arc`; methods are synchronous (embedded stores commit within
/// the call) and are invoked from the room coordinator, which is the
/// designated suspension point for durable appends.
pub trait OpStore: Clone + Send + Sync + 'static {
    /// Durably append an op and return its assigned sequence.
    ///
    /// # Errors
    ///
    /// `OpStoreError::Unavailable` if the write did not become durable.
    /// After an error the caller must assume nothing was persisted.
    fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
        ts: u64,
    ) -> Result<u64, OpStoreError>;

    /// Scan ops with `seq > from_seq`, ascending, at most `limit`.
    fn range_scan(
        &self,
        room_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<OpRecord>, OpStoreError>;

    /// Highest assigned sequence for a room, `None` if no ops.
    fn latest_seq(&self, room_id: &str) -> Result<Option<u64>, OpStoreError>;

    /// Drop ops with `seq < before_seq` (compaction). Returns the number
    /// removed.
    fn truncate_before(&self, room_id: &str, before_seq: u64) -> Result<u64, OpStoreError>;

    /// Cheap liveness probe for the health endpoint.
    fn ping(&self) -> Result<(), OpStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = OpStoreError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "op store unavailable: connection refused");

        let err = OpStoreError::Serialization("bad cbor".to_string());
        assert_eq!(err.to_string(), "op store serialization error: bad cbor");

        let err = OpStoreError::Conflict { expected: 7, got: 4 };
        assert_eq!(err.to_string(), "op sequence conflict: expected 7, got 4");
    }
}
