//! Entries of the replicated per-room stream.
//!
//! Every pod appends its locally-applied updates to a per-room append-only
//! log and consumes the entries of its peers. Entries carry an origin tag
//! so a pod can skip its own echoes, and enough metadata for the consumer
//! to deduplicate: presence records carry `(user_id, source_ts)`, storage
//! records carry the store-assigned sequence (CRDT applies are idempotent
//! anyway).

use std::collections::BTreeMap;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Origin tag of a stream entry: which pod appended it, and its local
/// publish sequence on that pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamOrigin {
    /// Stable pod identifier (`POD_ID`).
    pub pod_id: String,
    /// Per-pod, per-room monotonic publish sequence. Gap-free per pod.
    pub local_seq: u64,
}

/// The replicated payload of one stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamRecord {
    /// A presence diff already applied on the origin pod.
    Presence {
        /// Subject user.
        user_id: String,
        /// Overwritten fields, `None` for a tombstone.
        fields: Option<BTreeMap<String, Value>>,
        /// Origin-stamped time; consumers reject stale values per user.
        source_ts: u64,
    },
    /// A storage op already durably appended on the origin pod.
    Storage {
        /// Sequence assigned by the op store on append.
        seq: u64,
        /// Opaque CRDT update bytes.
        bytes: Vec<u8>,
    },
}

/// One entry of the per-room stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Who appended this entry.
    pub origin: StreamOrigin,
    /// The replicated update.
    pub record: StreamRecord,
}

impl StreamEntry {
    /// Encode to CBOR for the stream provider.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from stream provider bytes.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` on malformed CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}
