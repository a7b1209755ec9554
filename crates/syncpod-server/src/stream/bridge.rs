//! Stream bridge: the consuming half of cross-pod replication.
//!
//! One bridge per room tracks a cursor into the room's stream. Reads
//! move strictly forward; if trimming has removed entries between the
//! cursor and the oldest retained id, the bridge reports a gap instead
//! of stepping over it — the coordinator then rebuilds from the op
//! store (the durable source of truth) and the bridge reseeds at the
//! head. Delivery is at-least-once: after a restart the cursor reseeds
//! to the head post-replay, and duplicates inside a run are absorbed by
//! the CRDT's idempotence and the presence table's timestamp dedupe.

use std::time::Duration;

use syncpod_proto::StreamEntry;

use super::{stream_name, StreamError, StreamLog};

/// What one poll of the stream produced.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Decoded entries, cursor advanced past them.
    Entries(Vec<StreamEntry>),
    /// Nothing new before the timeout.
    Empty,
    /// The cursor points into trimmed history: `oldest` is the first
    /// retained id. The caller must full-sync, then [`StreamBridge::seed_to_head`].
    Gap {
        /// Oldest id still retained by the provider.
        oldest: u64,
    },
}

/// Per-room stream consumer.
pub struct StreamBridge<L: StreamLog> {
    log: L,
    stream: String,
    cursor: u64,
}

impl<L: StreamLog> StreamBridge<L> {
    /// Bridge for `room_id` starting at cursor 0 (stream origin).
    pub fn new(log: L, room_id: &str) -> Self {
        Self { log, stream: stream_name(room_id), cursor: 0 }
    }

    /// Current cursor (id of the last consumed entry).
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Entries between our cursor and the stream head.
    ///
    /// # Errors
    ///
    /// `StreamError::Unavailable` from the provider.
    pub fn lag(&self) -> Result<u64, StreamError> {
        Ok(self.log.head(&self.stream)?.saturating_sub(self.cursor))
    }

    /// Skip everything currently in the stream. Called after cold replay
    /// (replayed ops already cover the stream's history) and after a
    /// gap-triggered full sync.
    ///
    /// # Errors
    ///
    /// `StreamError::Unavailable` from the provider.
    pub fn seed_to_head(&mut self) -> Result<(), StreamError> {
        self.cursor = self.log.head(&self.stream)?;
        Ok(())
    }

    /// Poll for the next batch of peer entries.
    ///
    /// Undecodable payloads are logged and skipped; a bad entry from a
    /// buggy peer must not wedge the room.
    ///
    /// # Errors
    ///
    /// `StreamError::Unavailable` from the provider; the cursor is
    /// unchanged so the read retries after backoff.
    pub async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<BatchOutcome, StreamError> {
        // Gap check first: a cursor inside trimmed history must not be
        // advanced through the hole.
        if let Some(oldest) = self.log.oldest(&self.stream)? {
            if self.cursor + 1 < oldest {
                return Ok(BatchOutcome::Gap { oldest });
            }
        }

        let raw = self.log.read_from(&self.stream, self.cursor, max, timeout).await?;
        if raw.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        // Trimming may have raced the read.
        if raw[0].id > self.cursor + 1 {
            return Ok(BatchOutcome::Gap { oldest: raw[0].id });
        }

        let mut entries = Vec::with_capacity(raw.len());
        for log_entry in raw {
            match StreamEntry::decode(&log_entry.payload) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(stream = %self.stream, id = log_entry.id, error = %err,
                        "skipping undecodable stream entry");
                },
            }
            self.cursor = log_entry.id;
        }

        Ok(BatchOutcome::Entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use syncpod_proto::{StreamOrigin, StreamRecord};

    use super::super::MemoryStreamLog;
    use super::*;

    fn entry(pod: &str, local_seq: u64) -> StreamEntry {
        StreamEntry {
            origin: StreamOrigin { pod_id: pod.into(), local_seq },
            record: StreamRecord::Storage { seq: local_seq + 1, bytes: vec![1, 2, 3] },
        }
    }

    fn append(log: &MemoryStreamLog, room: &str, e: &StreamEntry) {
        log.append(&stream_name(room), &e.encode().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn consumes_in_order_and_advances_cursor() {
        let log = MemoryStreamLog::new(100);
        append(&log, "R", &entry("pod-b", 0));
        append(&log, "R", &entry("pod-b", 1));

        let mut bridge = StreamBridge::new(log, "R");
        let outcome = bridge.next_batch(10, Duration::from_millis(50)).await.unwrap();

        match outcome {
            BatchOutcome::Entries(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].origin.local_seq, 0);
                assert_eq!(entries[1].origin.local_seq, 1);
            },
            other => panic!("expected entries, got {other:?}"),
        }
        assert_eq!(bridge.cursor(), 2);
        assert_eq!(bridge.lag().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_on_timeout() {
        let log = MemoryStreamLog::new(100);
        let mut bridge = StreamBridge::new(log, "R");

        let outcome = bridge.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Empty);
        assert_eq!(bridge.cursor(), 0);
    }

    #[tokio::test]
    async fn gap_detected_after_trim() {
        let log = MemoryStreamLog::new(3);
        for i in 0..10 {
            append(&log, "R", &entry("pod-b", i));
        }

        // Cursor 0, oldest retained is 8: that is a gap.
        let mut bridge = StreamBridge::new(log, "R");
        let outcome = bridge.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Gap { oldest: 8 }));
        assert_eq!(bridge.cursor(), 0);
    }

    #[tokio::test]
    async fn seed_to_head_recovers_from_gap() {
        let log = MemoryStreamLog::new(3);
        for i in 0..10 {
            append(&log, "R", &entry("pod-b", i));
        }

        let mut bridge = StreamBridge::new(log.clone(), "R");
        bridge.seed_to_head().unwrap();
        assert_eq!(bridge.lag().unwrap(), 0);

        append(&log, "R", &entry("pod-b", 10));
        let outcome = bridge.next_batch(10, Duration::from_millis(50)).await.unwrap();
        match outcome {
            BatchOutcome::Entries(entries) => assert_eq!(entries.len(), 1),
            other => panic!("expected entries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped_not_fatal() {
        let log = MemoryStreamLog::new(100);
        log.append(&stream_name("R"), &[0xFF, 0x13]).unwrap();
        append(&log, "R", &entry("pod-b", 0));

        let mut bridge = StreamBridge::new(log, "R");
        let outcome = bridge.next_batch(10, Duration::from_millis(50)).await.unwrap();

        match outcome {
            BatchOutcome::Entries(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].origin.pod_id, "pod-b");
            },
            other => panic!("expected entries, got {other:?}"),
        }
        assert_eq!(bridge.cursor(), 2);
    }
}
