//! In-process stream provider.
//!
//! A shared-memory implementation of [`StreamLog`]: clones share state,
//! so every pod handed a clone sees the same streams. This is the
//! provider used by single-node deployments and the multi-pod test
//! harness; a networked provider plugs in behind the same trait.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use super::{LogEntry, StreamError, StreamLog};

struct StreamState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
}

/// Shared in-memory [`StreamLog`] with length-bounded retention.
#[derive(Clone)]
pub struct MemoryStreamLog {
    inner: Arc<Inner>,
    max_entries: usize,
}

impl MemoryStreamLog {
    /// New log retaining at most `max_entries` per stream.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
            max_entries: max_entries.max(1),
        }
    }

    fn collect_after(state: &StreamState, from: u64, max: usize) -> Vec<LogEntry> {
        state.entries.iter().filter(|e| e.id > from).take(max).cloned().collect()
    }
}

impl StreamLog for MemoryStreamLog {
    fn append(&self, stream: &str, payload: &[u8]) -> Result<u64, StreamError> {
        let id = {
            let mut streams = self.inner.streams.lock().expect("stream mutex poisoned");
            let state = streams
                .entry(stream.to_string())
                .or_insert_with(|| StreamState { entries: VecDeque::new(), next_id: 1 });

            let id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(LogEntry { id, payload: payload.to_vec() });

            // Length-bounded retention: readers that fall behind the cap
            // hit a gap and must full-sync.
            while state.entries.len() > self.max_entries {
                state.entries.pop_front();
            }

            id
        };

        self.inner.notify.notify_waiters();
        Ok(id)
    }

    async fn read_from(
        &self,
        stream: &str,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>, StreamError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking: notify_waiters only
            // wakes enabled waiters, so enabling after the check would
            // race appends.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let streams = self.inner.streams.lock().expect("stream mutex poisoned");
                if let Some(state) = streams.get(stream) {
                    let entries = Self::collect_after(state, from, max);
                    if !entries.is_empty() {
                        return Ok(entries);
                    }
                }
            }

            tokio::select! {
                () = &mut notified => {},
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn range(&self, stream: &str, from: u64, to: u64) -> Result<Vec<LogEntry>, StreamError> {
        let streams = self.inner.streams.lock().expect("stream mutex poisoned");

        Ok(streams
            .get(stream)
            .map(|state| {
                state.entries.iter().filter(|e| e.id > from && e.id <= to).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn head(&self, stream: &str) -> Result<u64, StreamError> {
        let streams = self.inner.streams.lock().expect("stream mutex poisoned");
        Ok(streams.get(stream).map_or(0, |state| state.next_id - 1))
    }

    fn oldest(&self, stream: &str) -> Result<Option<u64>, StreamError> {
        let streams = self.inner.streams.lock().expect("stream mutex poisoned");
        Ok(streams.get(stream).and_then(|state| state.entries.front().map(|e| e.id)))
    }
}
