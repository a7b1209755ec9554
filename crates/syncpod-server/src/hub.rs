//! Per-session delivery endpoint for the room hub.
//!
//! The room coordinator fans frames out by pushing into each session's
//! [`EgressHandle`]; the session's egress task pumps frames from the
//! handle onto the wire. The handle wraps the bounded
//! [`EgressQueue`](syncpod_core::egress::EgressQueue), so the byte and
//! frame bounds hold no matter how fast the coordinator publishes, and
//! a session whose queue stays full past the slow-client timeout is
//! flagged for draining.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use syncpod_core::egress::{EgressClass, EgressConfig, EgressQueue, PushOutcome};
use syncpod_proto::Frame;
use tokio::sync::Notify;

struct Shared {
    queue: Mutex<EgressQueue>,
    notify: Notify,
    slow: AtomicBool,
    closed: AtomicBool,
}

/// Cloneable handle to one session's egress queue.
#[derive(Clone)]
pub struct EgressHandle {
    shared: Arc<Shared>,
}

impl EgressHandle {
    /// New handle with the given bounds.
    #[must_use]
    pub fn new(config: EgressConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(EgressQueue::new(config)),
                notify: Notify::new(),
                slow: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a frame for delivery. Returns the queue's verdict; also
    /// latches the slow-consumer flag when the queue reports it.
    pub fn push(&self, frame: Frame, class: EgressClass, now_ms: u64) -> PushOutcome {
        let outcome = {
            let mut queue = self.shared.queue.lock().expect("egress mutex poisoned");
            let outcome = queue.push(frame, class, now_ms);
            if queue.slow_consumer(now_ms) {
                self.shared.slow.store(true, Ordering::Release);
            }
            outcome
        };

        self.shared.notify.notify_one();
        outcome
    }

    /// Pop the next frame without waiting.
    pub fn try_pop(&self) -> Option<Frame> {
        self.shared.queue.lock().expect("egress mutex poisoned").pop()
    }

    /// Wait until a frame is available or the handle is closed. `None`
    /// means closed and fully drained.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            let notified = self.shared.notify.notified();

            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Whether the queue flagged this session as a slow consumer.
    #[must_use]
    pub fn is_slow(&self) -> bool {
        self.shared.slow.load(Ordering::Acquire)
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().expect("egress mutex poisoned").is_empty()
    }

    /// Buffered payload bytes (metrics and tests).
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.shared.queue.lock().expect("egress mutex poisoned").buffered_bytes()
    }

    /// Mark closed and wake the pump so it can finish the drain.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}
