//! Bounded per-session egress queue.
//!
//! The queue is bounded by total payload bytes AND by frame count, and
//! both bounds hold at every observable instant. Under pressure it sheds
//! presence first: presence is latest-wins per user, so any queued frame
//! for a user is replaced by a newer one (coalescing) and the oldest
//! queued presence frames are dropped to make room for anything else.
//! Storage and sync frames are never dropped; if the queue stays full of
//! them past the slow-client timeout the session is a slow consumer and
//! gets drained.

use std::collections::VecDeque;

use syncpod_proto::Frame;

/// Egress bounds and the slow-consumer deadline.
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Total queued payload bytes allowed (default 64 KiB).
    pub max_bytes: usize,
    /// Queued frame count allowed (default 256).
    pub max_frames: usize,
    /// How long the queue may stay full before the session is declared a
    /// slow consumer (default 1 s).
    pub slow_client_timeout_ms: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { max_bytes: 64 * 1024, max_frames: 256, slow_client_timeout_ms: 1_000 }
    }
}

/// Class of a queued frame, deciding its fate under pressure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressClass {
    /// Presence diff for one user; coalescable, droppable.
    Presence {
        /// User the diff belongs to (coalescing key).
        user_id: String,
    },
    /// Everything else (storage, syncs, control, errors); never dropped.
    Reliable,
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Whether the frame is now queued.
    pub queued: bool,
    /// Older presence frames for the same user replaced by this one.
    pub coalesced: u64,
    /// Other presence frames dropped to make room.
    pub shed: u64,
}

struct Queued {
    frame: Frame,
    class: EgressClass,
}

/// The bounded queue itself. Purely synchronous; the egress task pumps it.
pub struct EgressQueue {
    queue: VecDeque<Queued>,
    buffered_bytes: usize,
    config: EgressConfig,
    /// Set when a reliable frame could not be admitted; cleared when space
    /// frees up. Drives the slow-consumer verdict.
    full_since_ms: Option<u64>,
}

impl EgressQueue {
    /// Empty queue with the given bounds.
    #[must_use]
    pub fn new(config: EgressConfig) -> Self {
        Self { queue: VecDeque::new(), buffered_bytes: 0, config, full_since_ms: None }
    }

    /// Queued frame count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total queued payload bytes.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Push a frame, applying the backpressure policy.
    ///
    /// Presence frames coalesce (replace any queued frame for the same
    /// user) before admission is checked. If bounds are still exceeded,
    /// the oldest queued presence frames are shed. A reliable frame that
    /// still cannot fit is rejected and starts the full-queue clock; a
    /// presence frame that cannot fit is simply shed (it will be
    /// superseded anyway).
    pub fn push(&mut self, frame: Frame, class: EgressClass, now_ms: u64) -> PushOutcome {
        let mut outcome = PushOutcome { queued: false, coalesced: 0, shed: 0 };

        if let EgressClass::Presence { user_id } = &class {
            outcome.coalesced = self.remove_presence_for(user_id);
        }

        let frame_bytes = frame.encoded_len();

        // Shed oldest presence until this frame fits.
        while !self.fits(frame_bytes) {
            match self.drop_oldest_presence() {
                Some(()) => outcome.shed += 1,
                None => break,
            }
        }

        if self.fits(frame_bytes) {
            self.buffered_bytes += frame_bytes;
            self.queue.push_back(Queued { frame, class });
            outcome.queued = true;
            self.full_since_ms = None;
        } else if matches!(class, EgressClass::Reliable) {
            // Only reliable frames remain and the queue is full: start (or
            // keep) the slow-consumer clock.
            self.full_since_ms.get_or_insert(now_ms);
        } else {
            outcome.shed += 1;
        }

        outcome
    }

    /// Pop the next frame to write.
    pub fn pop(&mut self) -> Option<Frame> {
        let queued = self.queue.pop_front()?;
        self.buffered_bytes -= queued.frame.encoded_len();
        if self.fits(0) {
            self.full_since_ms = None;
        }
        Some(queued.frame)
    }

    /// Whether the session has been a slow consumer long enough to drain.
    #[must_use]
    pub fn slow_consumer(&self, now_ms: u64) -> bool {
        self.full_since_ms
            .is_some_and(|since| now_ms.saturating_sub(since) > self.config.slow_client_timeout_ms)
    }

    /// Number of queued presence frames for one user (test/metric hook).
    #[must_use]
    pub fn presence_frames_for(&self, user_id: &str) -> usize {
        self.queue
            .iter()
            .filter(|q| matches!(&q.class, EgressClass::Presence { user_id: u } if u == user_id))
            .count()
    }

    fn fits(&self, extra_bytes: usize) -> bool {
        self.queue.len() < self.config.max_frames
            && self.buffered_bytes + extra_bytes <= self.config.max_bytes
    }

    fn remove_presence_for(&mut self, user_id: &str) -> u64 {
        let before = self.queue.len();
        let mut removed_bytes = 0;
        self.queue.retain(|q| {
            let matches =
                matches!(&q.class, EgressClass::Presence { user_id: u } if u == user_id);
            if matches {
                removed_bytes += q.frame.encoded_len();
            }
            !matches
        });
        self.buffered_bytes -= removed_bytes;
        (before - self.queue.len()) as u64
    }

    fn drop_oldest_presence(&mut self) -> Option<()> {
        let idx = self
            .queue
            .iter()
            .position(|q| matches!(q.class, EgressClass::Presence { .. }))?;
        let dropped = self.queue.remove(idx).expect("position came from this queue");
        self.buffered_bytes -= dropped.frame.encoded_len();
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use syncpod_proto::FrameKind;

    use super::*;

    fn presence_frame(payload_len: usize) -> Frame {
        Frame::new(FrameKind::PresenceDiff, vec![0u8; payload_len])
    }

    fn storage_frame(payload_len: usize) -> Frame {
        Frame::new(FrameKind::StorageUpdate, vec![1u8; payload_len])
    }

    fn presence(user: &str) -> EgressClass {
        EgressClass::Presence { user_id: user.to_string() }
    }

    fn small_config() -> EgressConfig {
        EgressConfig { max_bytes: 100, max_frames: 4, slow_client_timeout_ms: 1_000 }
    }

    #[test]
    fn queues_within_bounds() {
        let mut q = EgressQueue::new(small_config());
        let outcome = q.push(storage_frame(10), EgressClass::Reliable, 0);
        assert!(outcome.queued);
        assert_eq!(q.len(), 1);
        assert_eq!(q.buffered_bytes(), 11);
    }

    #[test]
    fn presence_coalesces_per_user() {
        let mut q = EgressQueue::new(small_config());

        q.push(presence_frame(5), presence("u1"), 0);
        let outcome = q.push(presence_frame(7), presence("u1"), 0);

        assert!(outcome.queued);
        assert_eq!(outcome.coalesced, 1);
        assert_eq!(q.presence_frames_for("u1"), 1);
        assert_eq!(q.buffered_bytes(), 8);
    }

    #[test]
    fn coalescing_is_per_user_not_global() {
        let mut q = EgressQueue::new(small_config());

        q.push(presence_frame(5), presence("u1"), 0);
        q.push(presence_frame(5), presence("u2"), 0);
        q.push(presence_frame(5), presence("u1"), 0);

        assert_eq!(q.presence_frames_for("u1"), 1);
        assert_eq!(q.presence_frames_for("u2"), 1);
    }

    #[test]
    fn sustained_presence_leaves_one_frame_per_user() {
        let mut q = EgressQueue::new(small_config());

        let mut coalesced = 0;
        for _ in 0..1000 {
            coalesced += q.push(presence_frame(5), presence("u1"), 0).coalesced;
        }

        assert_eq!(q.presence_frames_for("u1"), 1);
        assert_eq!(coalesced, 999);
    }

    #[test]
    fn presence_shed_before_storage() {
        let mut q = EgressQueue::new(small_config());

        q.push(presence_frame(30), presence("u1"), 0);
        q.push(presence_frame(30), presence("u2"), 0);
        // 62 bytes buffered; a 40-byte storage frame needs the presence
        // frames out of the way.
        let outcome = q.push(storage_frame(40), EgressClass::Reliable, 0);

        assert!(outcome.queued);
        assert_eq!(outcome.shed, 1);
        assert_eq!(q.presence_frames_for("u1"), 0);
        assert_eq!(q.presence_frames_for("u2"), 1);
    }

    #[test]
    fn bounds_hold_at_every_instant() {
        let config = small_config();
        let mut q = EgressQueue::new(config.clone());

        for i in 0..200 {
            let (frame, class) = if i % 3 == 0 {
                (storage_frame(20), EgressClass::Reliable)
            } else {
                (presence_frame(15), presence(if i % 2 == 0 { "a" } else { "b" }))
            };
            q.push(frame, class, i);

            assert!(q.buffered_bytes() <= config.max_bytes);
            assert!(q.len() <= config.max_frames);
        }
    }

    #[test]
    fn slow_consumer_fires_after_timeout() {
        let mut q = EgressQueue::new(small_config());

        // Fill with storage frames nothing can shed.
        for _ in 0..4 {
            q.push(storage_frame(20), EgressClass::Reliable, 0);
        }
        let outcome = q.push(storage_frame(20), EgressClass::Reliable, 100);
        assert!(!outcome.queued);

        assert!(!q.slow_consumer(100));
        assert!(!q.slow_consumer(1_100));
        assert!(q.slow_consumer(1_101));
    }

    #[test]
    fn draining_clears_slow_consumer_clock() {
        let mut q = EgressQueue::new(small_config());

        for _ in 0..4 {
            q.push(storage_frame(20), EgressClass::Reliable, 0);
        }
        q.push(storage_frame(20), EgressClass::Reliable, 100);

        // Client catches up.
        while q.pop().is_some() {}
        assert!(!q.slow_consumer(10_000));
    }

    #[test]
    fn pop_returns_fifo_and_updates_bytes() {
        let mut q = EgressQueue::new(small_config());
        q.push(storage_frame(10), EgressClass::Reliable, 0);
        q.push(presence_frame(5), presence("u1"), 0);

        let first = q.pop().unwrap();
        assert_eq!(first.kind, FrameKind::StorageUpdate);
        assert_eq!(q.buffered_bytes(), 6);

        let second = q.pop().unwrap();
        assert_eq!(second.kind, FrameKind::PresenceDiff);
        assert_eq!(q.buffered_bytes(), 0);
        assert!(q.pop().is_none());
    }
}
