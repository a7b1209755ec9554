//! Replicated per-room stream.
//!
//! Pods exchange applied updates through a named append-only log per
//! room. The pod depends only on the small [`StreamLog`] surface —
//! append, blocking read, range, head/oldest — so any provider with
//! totally-ordered entry ids can back it. History is bounded: when a
//! consumer's cursor falls behind the oldest retained entry it must not
//! step over the gap; it performs a full sync instead (see
//! [`bridge::StreamBridge`]).

pub mod bridge;
mod memory;

pub use bridge::{BatchOutcome, StreamBridge};
pub use memory::MemoryStreamLog;
use thiserror::Error;

/// Errors from the stream provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Provider unreachable. Retried with backoff; storage ingress is
    /// refused while it lasts so durable ops never outrun replication.
    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

/// One stream entry as stored by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Totally-ordered entry id, assigned by the provider from 1.
    pub id: u64,
    /// Opaque payload (CBOR-encoded `StreamEntry`).
    pub payload: Vec<u8>,
}

/// Append-only log abstraction over the stream provider.
pub trait StreamLog: Clone + Send + Sync + 'static {
    /// Append a payload, returning its assigned id.
    ///
    /// # Errors
    ///
    /// `StreamError::Unavailable` if the provider rejected the write.
    fn append(&self, stream: &str, payload: &[u8]) -> Result<u64, StreamError>;

    /// Read entries with `id > from`, up to `max`, waiting up to
    /// `timeout` for at least one. An empty vec means timeout.
    fn read_from(
        &self,
        stream: &str,
        from: u64,
        max: usize,
        timeout: std::time::Duration,
    ) -> impl std::future::Future<Output = Result<Vec<LogEntry>, StreamError>> + Send;

    /// Entries with `from < id <= to`, non-blocking.
    fn range(&self, stream: &str, from: u64, to: u64) -> Result<Vec<LogEntry>, StreamError>;

    /// Highest assigned id (0 if the stream is empty).
    fn head(&self, stream: &str) -> Result<u64, StreamError>;

    /// Oldest retained id, `None` if the stream is empty. Trimming makes
    /// this advance past 1.
    fn oldest(&self, stream: &str) -> Result<Option<u64>, StreamError>;
}

/// Stream name for a room.
#[must_use]
pub fn stream_name(room_id: &str) -> String {
    format!("room:{room_id}")
}
