//! Session state machine.
//!
//! One client connection in one room. Pure logic in the action pattern:
//! methods take the current time and return actions for the socket driver
//! to execute (forward to the room coordinator, write a frame, drain,
//! close). No I/O happens here.
//!
//! ```text
//! Opening --(auth ok, attach ok, initial sync queued)--> Live
//! Opening --(auth fail | attach fail)-----------------> Closed
//! Live ----(drain signal | keepalive timeout)---------> Draining
//! Live ----(fatal error)------------------------------> Closed
//! Draining --(egress flushed | timeout)---------------> Closed
//! ```
//!
//! Ingress policy: frames are rejected while `Opening`; presence and
//! storage classes each have a token bucket, and sustained violation of
//! either budget drains the session. Malformed frames are counted in a
//! sliding window and only repeated violations close the session.

use bytes::Bytes;
use syncpod_proto::{
    ControlMsg, ErrorCode, ErrorPayload, Frame, FrameKind, PresenceUpdate, ProtocolError,
};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; token verified but initial sync not yet delivered.
    Opening,
    /// Serving live traffic.
    Live,
    /// Flushing egress before close.
    Draining,
    /// Terminal.
    Closed,
}

/// Why a session entered `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// Egress stayed full past the slow-client timeout.
    SlowConsumer,
    /// Sustained rate-limit violation.
    RateLimited,
    /// No pong within the keepalive deadline.
    KeepaliveTimeout,
    /// Pod is shutting down.
    Shutdown,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Too many malformed frames in the window.
    ProtocolViolation,
    /// Token rejected.
    Unauthorized,
    /// Drain completed (flushed or timed out).
    Drained,
    /// Transport dropped underneath us.
    TransportClosed,
    /// Room attach failed (capacity).
    AttachFailed,
}

impl DrainReason {
    /// Metric label for `session_closes(reason)`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow_consumer",
            Self::RateLimited => "rate_limited",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

impl CloseReason {
    /// Metric label for `session_closes(reason)`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "protocol_violation",
            Self::Unauthorized => "unauthorized",
            Self::Drained => "drained",
            Self::TransportClosed => "transport_closed",
            Self::AttachFailed => "attach_failed",
        }
    }
}

/// Decoded ingress handed to the room coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingress {
    /// Presence diff from this client (identity comes from the session).
    Presence(PresenceUpdate),
    /// Opaque storage update bytes.
    Storage(Bytes),
    /// Client asked for a fresh presence snapshot.
    Resync,
}

/// Actions for the socket driver to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Hand decoded ingress to the room coordinator.
    Deliver(Ingress),
    /// Write a frame to this client.
    Send(Frame),
    /// Transition to draining with the given reason.
    BeginDrain(DrainReason),
    /// Close the session.
    Close(CloseReason),
}

/// Rate limits, keepalive, and violation thresholds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Presence frames per second.
    pub presence_rate: f64,
    /// Presence burst size.
    pub presence_burst: f64,
    /// Storage frames per second.
    pub storage_rate: f64,
    /// Storage burst size.
    pub storage_burst: f64,
    /// Malformed frames tolerated within the window before close.
    pub malformed_limit: u32,
    /// Malformed-frame window (ms).
    pub malformed_window_ms: u64,
    /// Sustained-violation multiplier: drops exceeding
    /// `factor * rate * window` within the window drain the session.
    pub violation_factor: f64,
    /// Sustained-violation window (ms).
    pub violation_window_ms: u64,
    /// Ping interval (ms).
    pub ping_interval_ms: u64,
    /// Close if no pong for this long (ms).
    pub pong_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence_rate: 20.0,
            presence_burst: 5.0,
            storage_rate: 200.0,
            storage_burst: 50.0,
            malformed_limit: 8,
            malformed_window_ms: 10_000,
            violation_factor: 3.0,
            violation_window_ms: 5_000,
            ping_interval_ms: 20_000,
            pong_timeout_ms: 40_000,
        }
    }
}

/// Running counters, scraped by the runtime into pod metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Malformed frames seen (all time).
    pub malformed: u64,
    /// Presence frames dropped by the rate limiter.
    pub rate_dropped_presence: u64,
    /// Storage frames dropped by the rate limiter.
    pub rate_dropped_storage: u64,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(rate_per_s: f64, burst: f64, now_ms: u64) -> Self {
        Self { tokens: burst, capacity: burst, rate_per_ms: rate_per_s / 1_000.0, last_refill_ms: now_ms }
    }

    fn try_take(&mut self, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.rate_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Events counted within a rolling window.
struct WindowCounter {
    window_ms: u64,
    start_ms: u64,
    count: u64,
}

impl WindowCounter {
    fn new(window_ms: u64) -> Self {
        Self { window_ms, start_ms: 0, count: 0 }
    }

    fn record(&mut self, now_ms: u64) -> u64 {
        if now_ms.saturating_sub(self.start_ms) > self.window_ms {
            self.start_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count
    }
}

/// The session state machine.
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    presence_bucket: TokenBucket,
    storage_bucket: TokenBucket,
    malformed_window: WindowCounter,
    presence_violations: WindowCounter,
    storage_violations: WindowCounter,
    last_ping_sent_ms: u64,
    last_pong_ms: u64,
    stats: SessionStats,
}

impl Session {
    /// New session in `Opening`.
    #[must_use]
    pub fn new(now_ms: u64, config: SessionConfig) -> Self {
        Self {
            presence_bucket: TokenBucket::new(config.presence_rate, config.presence_burst, now_ms),
            storage_bucket: TokenBucket::new(config.storage_rate, config.storage_burst, now_ms),
            malformed_window: WindowCounter::new(config.malformed_window_ms),
            presence_violations: WindowCounter::new(config.violation_window_ms),
            storage_violations: WindowCounter::new(config.violation_window_ms),
            last_ping_sent_ms: now_ms,
            last_pong_ms: now_ms,
            state: SessionState::Opening,
            config,
            stats: SessionStats::default(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counters for metric scraping.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// `Opening → Live` after attach succeeded and the initial sync
    /// (presence + storage snapshots) has been queued ahead of any live
    /// frame.
    pub fn activate(&mut self, now_ms: u64) {
        if self.state == SessionState::Opening {
            self.state = SessionState::Live;
            self.last_pong_ms = now_ms;
            self.last_ping_sent_ms = now_ms;
        }
    }

    /// Enter draining. Idempotent; later reasons do not override.
    pub fn begin_drain(&mut self) {
        if matches!(self.state, SessionState::Opening | SessionState::Live) {
            self.state = SessionState::Draining;
        }
    }

    /// Terminal transition.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Process one raw transport message.
    pub fn on_message(&mut self, bytes: &[u8], now_ms: u64) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Closed | SessionState::Draining) {
            return Vec::new();
        }

        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => return self.record_malformed(now_ms, &err),
        };

        if self.state == SessionState::Opening {
            // No live traffic before the initial sync is queued.
            return self.record_malformed(now_ms, &ProtocolError::DirectionViolation(frame.kind));
        }

        if !frame.kind.client_sendable() {
            return self.record_malformed(now_ms, &ProtocolError::DirectionViolation(frame.kind));
        }

        match frame.kind {
            FrameKind::PresenceDiff => self.on_presence(&frame, now_ms),
            FrameKind::StorageUpdate => self.on_storage(frame, now_ms),
            FrameKind::Control => self.on_control(&frame, now_ms),
            // Clients may echo error frames; nothing to do with them.
            FrameKind::Error => Vec::new(),
            FrameKind::PresenceSync | FrameKind::StorageSync => unreachable!("filtered above"),
        }
    }

    /// Periodic maintenance: keepalive ping and pong deadline.
    pub fn on_tick(&mut self, now_ms: u64) -> Vec<SessionAction> {
        if self.state != SessionState::Live {
            return Vec::new();
        }

        let mut actions = Vec::new();

        if now_ms.saturating_sub(self.last_pong_ms) > self.config.pong_timeout_ms {
            self.state = SessionState::Draining;
            actions.push(SessionAction::BeginDrain(DrainReason::KeepaliveTimeout));
            return actions;
        }

        if now_ms.saturating_sub(self.last_ping_sent_ms) >= self.config.ping_interval_ms {
            self.last_ping_sent_ms = now_ms;
            actions.push(SessionAction::Send(ControlMsg::Ping.to_frame()));
        }

        actions
    }

    fn on_presence(&mut self, frame: &Frame, now_ms: u64) -> Vec<SessionAction> {
        if !self.presence_bucket.try_take(now_ms) {
            self.stats.rate_dropped_presence += 1;
            let budget = self.config.presence_rate
                * self.config.violation_factor
                * (self.config.violation_window_ms as f64 / 1_000.0);
            if self.presence_violations.record(now_ms) as f64 >= budget {
                self.state = SessionState::Draining;
                return vec![SessionAction::BeginDrain(DrainReason::RateLimited)];
            }
            return Vec::new();
        }

        match PresenceUpdate::from_payload(&frame.payload) {
            Ok(update) => vec![SessionAction::Deliver(Ingress::Presence(update))],
            Err(err) => self.record_malformed(now_ms, &err),
        }
    }

    fn on_storage(&mut self, frame: Frame, now_ms: u64) -> Vec<SessionAction> {
        if !self.storage_bucket.try_take(now_ms) {
            self.stats.rate_dropped_storage += 1;
            let budget = self.config.storage_rate
                * self.config.violation_factor
                * (self.config.violation_window_ms as f64 / 1_000.0);
            if self.storage_violations.record(now_ms) as f64 >= budget {
                self.state = SessionState::Draining;
                return vec![SessionAction::BeginDrain(DrainReason::RateLimited)];
            }
            return Vec::new();
        }

        vec![SessionAction::Deliver(Ingress::Storage(frame.payload))]
    }

    fn on_control(&mut self, frame: &Frame, now_ms: u64) -> Vec<SessionAction> {
        match ControlMsg::from_payload(&frame.payload) {
            Ok(ControlMsg::Ping) => vec![SessionAction::Send(ControlMsg::Pong.to_frame())],
            Ok(ControlMsg::Pong) => {
                self.last_pong_ms = now_ms;
                Vec::new()
            },
            Ok(ControlMsg::Resync) => vec![SessionAction::Deliver(Ingress::Resync)],
            // Drain is pod→client only.
            Ok(ControlMsg::Drain) => self.record_malformed(
                now_ms,
                &ProtocolError::InvalidPayload("client sent drain".into()),
            ),
            Err(err) => self.record_malformed(now_ms, &err),
        }
    }

    fn record_malformed(&mut self, now_ms: u64, err: &ProtocolError) -> Vec<SessionAction> {
        self.stats.malformed += 1;
        tracing::debug!(error = %err, "malformed frame");

        if self.malformed_window.record(now_ms) >= u64::from(self.config.malformed_limit) {
            self.state = SessionState::Closed;
            return vec![
                SessionAction::Send(
                    ErrorPayload::new(ErrorCode::ProtocolViolation, "too many malformed frames")
                        .to_frame(),
                ),
                SessionAction::Close(CloseReason::ProtocolViolation),
            ];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn live_session(now_ms: u64) -> Session {
        let mut session = Session::new(now_ms, SessionConfig::default());
        session.activate(now_ms);
        session
    }

    fn presence_bytes() -> Vec<u8> {
        PresenceUpdate { user_id: None, fields: Some(BTreeMap::new()), source_ts: 0 }
            .to_frame()
            .unwrap()
            .to_vec()
            .unwrap()
    }

    fn storage_bytes(payload: &[u8]) -> Vec<u8> {
        Frame::new(FrameKind::StorageUpdate, payload.to_vec()).to_vec().unwrap()
    }

    #[test]
    fn opening_rejects_frames() {
        let mut session = Session::new(0, SessionConfig::default());
        let actions = session.on_message(&storage_bytes(b"x"), 0);
        assert!(actions.is_empty());
        assert_eq!(session.stats().malformed, 1);
    }

    #[test]
    fn live_forwards_storage() {
        let mut session = live_session(0);
        let actions = session.on_message(&storage_bytes(b"update"), 1);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            SessionAction::Deliver(Ingress::Storage(bytes)) if bytes.as_ref() == b"update"
        ));
    }

    #[test]
    fn live_forwards_presence() {
        let mut session = live_session(0);
        let actions = session.on_message(&presence_bytes(), 1);
        assert!(matches!(&actions[0], SessionAction::Deliver(Ingress::Presence(_))));
    }

    #[test]
    fn sync_frames_from_client_are_violations() {
        let mut session = live_session(0);
        let sync = Frame::new(FrameKind::PresenceSync, vec![]).to_vec().unwrap();
        assert!(session.on_message(&sync, 1).is_empty());
        assert_eq!(session.stats().malformed, 1);
    }

    #[test]
    fn repeated_malformed_closes_with_error_frame() {
        let mut session = live_session(0);

        let mut last = Vec::new();
        for i in 0..8u64 {
            last = session.on_message(&[0xAA, 0xBB], i);
        }

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(last.len(), 2);
        assert!(matches!(&last[0], SessionAction::Send(f) if f.kind == FrameKind::Error));
        assert!(matches!(last[1], SessionAction::Close(CloseReason::ProtocolViolation)));
    }

    #[test]
    fn malformed_outside_window_does_not_close() {
        let mut session = live_session(0);

        for i in 0..6u64 {
            session.on_message(&[0xAA], i);
        }
        // Window rolls over; the count restarts.
        for i in 0..6u64 {
            session.on_message(&[0xAA], 20_000 + i);
        }

        assert_ne!(session.state(), SessionState::Closed);
    }

    #[test]
    fn presence_rate_limit_drops_excess() {
        let mut session = live_session(0);

        // Burst is 5; the 6th instantaneous frame is dropped.
        for _ in 0..6 {
            session.on_message(&presence_bytes(), 1);
        }

        assert_eq!(session.stats().rate_dropped_presence, 1);
        assert_eq!(session.state(), SessionState::Live);
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut session = live_session(0);

        for _ in 0..5 {
            session.on_message(&presence_bytes(), 1);
        }
        // 20/s refill: 100 ms buys two tokens.
        let actions = session.on_message(&presence_bytes(), 101);
        assert_eq!(actions.len(), 1);
        assert_eq!(session.stats().rate_dropped_presence, 0);
    }

    #[test]
    fn sustained_violation_drains() {
        let mut session = live_session(0);

        // 3 * 20/s * 5 s = 300 dropped presence frames within the window.
        let mut drained = false;
        for i in 0..400u64 {
            let actions = session.on_message(&presence_bytes(), 2 + (i / 50));
            if actions.iter().any(|a| matches!(a, SessionAction::BeginDrain(DrainReason::RateLimited))) {
                drained = true;
                break;
            }
        }

        assert!(drained);
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[test]
    fn ping_sent_on_interval_and_pong_tracked() {
        let mut session = live_session(0);

        assert!(session.on_tick(10_000).is_empty());

        let actions = session.on_tick(20_000);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], SessionAction::Send(f) if f.kind == FrameKind::Control));

        // Pong arrives; deadline pushes out.
        let pong = ControlMsg::Pong.to_frame().to_vec().unwrap();
        session.on_message(&pong, 25_000);

        assert!(session
            .on_tick(60_000)
            .iter()
            .all(|a| !matches!(a, SessionAction::BeginDrain(_))));
    }

    #[test]
    fn missing_pong_drains() {
        let mut session = live_session(0);
        let actions = session.on_tick(40_001);
        assert!(matches!(actions[0], SessionAction::BeginDrain(DrainReason::KeepaliveTimeout)));
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[test]
    fn client_ping_gets_pong() {
        let mut session = live_session(0);
        let ping = ControlMsg::Ping.to_frame().to_vec().unwrap();
        let actions = session.on_message(&ping, 1);
        assert!(matches!(&actions[0], SessionAction::Send(f) if f.kind == FrameKind::Control));
    }

    #[test]
    fn resync_is_delivered() {
        let mut session = live_session(0);
        let resync = ControlMsg::Resync.to_frame().to_vec().unwrap();
        let actions = session.on_message(&resync, 1);
        assert_eq!(actions, vec![SessionAction::Deliver(Ingress::Resync)]);
    }

    #[test]
    fn draining_ignores_ingress() {
        let mut session = live_session(0);
        session.begin_drain();
        assert!(session.on_message(&storage_bytes(b"x"), 1).is_empty());
    }
}
