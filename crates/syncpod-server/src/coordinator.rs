//! Room coordinator task.
//!
//! Exactly one coordinator task exists per materialized room, and it is
//! the only mutator of that room's presence table, CRDT document, and
//! session set. All mutations arrive as [`RoomMsg`]s on its inbox;
//! processing is serial, which gives every room a total order of applied
//! events, and that order is the order the hub publishes in.
//!
//! The inbox is drained under a weighted fair policy: presence and
//! storage messages are guaranteed 40/60 shares of each scheduling
//! quantum, so a flood of one class cannot starve the other. Control
//! messages (attach, detach, resync) bypass the shares.
//!
//! Storage ingress follows durable-before-apply: the op store append
//! happens first, and only after it returns is the op applied to the
//! document, broadcast locally, and replicated to peers. While the op
//! store or the stream is in backoff the coordinator refuses storage
//! with `TemporarilyReadOnly`, keeping the invariant intact; presence
//! keeps flowing locally throughout.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use syncpod_core::{
    backoff::RetryPolicy,
    crdt::CrdtKernel,
    egress::EgressClass,
    room::PeerOutcome,
    Environment, Room, RoomAction, RoomError, SessionId,
};
use syncpod_proto::{
    ErrorCode, ErrorPayload, Frame, PresenceSnapshot, PresenceUpdate, StreamEntry, StreamRecord,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    hub::EgressHandle,
    store::{OpStore, OpStoreError},
    stream::{stream_name, StreamLog},
    PodShared,
};

/// Messages accepted by a room coordinator.
pub enum RoomMsg {
    /// Attach a session; replies after the initial sync is queued.
    Attach {
        /// Session id
        session: SessionId,
        /// Authenticated user
        user_id: String,
        /// Delivery endpoint for this session
        egress: EgressHandle,
        /// Attach outcome
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Detach a session (socket closed or drained).
    Detach {
        /// Session id
        session: SessionId,
    },
    /// Presence diff from a local session.
    Presence {
        /// Origin session
        session: SessionId,
        /// The diff (identity fields ignored; stamped here)
        update: PresenceUpdate,
    },
    /// Storage update from a local session.
    Storage {
        /// Origin session
        session: SessionId,
        /// Opaque CRDT bytes
        bytes: Bytes,
    },
    /// Presence snapshot request from a local session.
    Resync {
        /// Requesting session
        session: SessionId,
    },
    /// Entry consumed from the peer stream.
    Peer {
        /// The replicated entry
        entry: StreamEntry,
    },
    /// Stream gap detected: rebuild from the op store, then reply.
    FullSync {
        /// Completion signal back to the bridge
        reply: oneshot::Sender<()>,
    },
    /// Consistent state snapshot (health checks and tests).
    Inspect {
        /// Reply with presence entries, CRDT snapshot bytes, session count
        reply: oneshot::Sender<RoomInspect>,
    },
}

/// Consistent view of a room, taken on the coordinator.
#[derive(Debug, Clone)]
pub struct RoomInspect {
    /// Presence snapshot.
    pub presence: PresenceSnapshot,
    /// CRDT snapshot bytes.
    pub storage: Vec<u8>,
    /// Attached session count.
    pub sessions: usize,
}

/// Messages per scheduling quantum, split 40/60 between presence and
/// storage.
const QUANTUM: usize = 40;
const PRESENCE_SHARE: usize = QUANTUM * 40 / 100;
const STORAGE_SHARE: usize = QUANTUM - PRESENCE_SHARE;

/// How many ops one replay batch loads.
const REPLAY_BATCH: usize = 256;

pub(crate) struct Coordinator<K, S, L, E>
where
    K: CrdtKernel,
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    room: Room<K>,
    rx: mpsc::Receiver<RoomMsg>,
    shared: PodShared<S, L, E>,
    egress: HashMap<SessionId, EgressHandle>,
    presence_q: VecDeque<RoomMsg>,
    storage_q: VecDeque<RoomMsg>,
    /// Stream payloads accepted but not yet appended to the provider.
    pending_stream: VecDeque<Vec<u8>>,
    /// While set (monotonic ms), storage ingress is refused.
    read_only_until: Option<u64>,
    backoff_attempts: u32,
    policy: RetryPolicy,
}

impl<K, S, L, E> Coordinator<K, S, L, E>
where
    K: CrdtKernel,
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    pub(crate) fn new(room: Room<K>, rx: mpsc::Receiver<RoomMsg>, shared: PodShared<S, L, E>) -> Self {
        Self {
            room,
            rx,
            shared,
            egress: HashMap::new(),
            presence_q: VecDeque::new(),
            storage_q: VecDeque::new(),
            pending_stream: VecDeque::new(),
            read_only_until: None,
            backoff_attempts: 0,
            policy: RetryPolicy::default(),
        }
    }

    /// Cold activation, run before the first message is processed: the
    /// first attach must already see the reconstructed document. A
    /// failed replay leaves the room serving presence but read-only for
    /// storage until the backoff expires and a later full sync repairs
    /// the document.
    pub(crate) fn activate(&mut self) {
        match self.cold_replay() {
            Ok(replayed) => {
                if replayed > 0 {
                    tracing::info!(room = %self.room.id(), replayed, "cold replay complete");
                }
            },
            Err(err) => {
                tracing::error!(room = %self.room.id(), error = %err, "cold replay failed");
                let now = self.shared.env.now_ms();
                self.enter_backoff(now);
            },
        }
    }

    /// Replay the room's op history through the kernel.
    fn cold_replay(&mut self) -> Result<u64, crate::store::OpStoreError> {
        let room_id = self.room.id().as_str().to_string();
        let mut cursor = 0u64;
        let mut replayed = 0u64;

        loop {
            let batch = self.shared.store.range_scan(&room_id, cursor, REPLAY_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for op in batch {
                cursor = op.seq;
                if let Err(err) = self.room.replay_op(&op.bytes) {
                    tracing::warn!(room = %room_id, seq = op.seq, error = %err,
                        "skipping unreplayable op");
                } else {
                    replayed += 1;
                }
            }
        }

        Ok(replayed)
    }

    /// Run until the room is destroyed (idle past the grace period) or
    /// the pod shuts down.
    pub(crate) async fn run(mut self) {
        let grace = self.shared.config.idle_room_grace;
        let mut expire = tokio::time::interval(std::time::Duration::from_millis(500));
        expire.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Rooms start empty; the first attach cancels the deadline.
        let mut idle_deadline = Some(tokio::time::Instant::now() + grace);
        let mut shutdown = self.shared.shutdown.clone();

        loop {
            if self.presence_q.is_empty() && self.storage_q.is_empty() {
                tokio::select! {
                    maybe = self.rx.recv() => match maybe {
                        Some(msg) => self.enqueue(msg),
                        None => break,
                    },
                    _ = expire.tick() => {
                        let now = self.shared.env.now_ms();
                        let actions = self.room.expire_presence(now);
                        self.execute(actions, now);
                        self.flush_stream(now);
                    },
                    _ = shutdown.changed() => break,
                    () = async {
                        match idle_deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        if self.room.is_empty() {
                            break;
                        }
                        idle_deadline = None;
                    },
                }
            }

            // Pull whatever else is already queued, then process one
            // fair quantum.
            while let Ok(msg) = self.rx.try_recv() {
                self.enqueue(msg);
            }
            self.process_quantum();

            idle_deadline = if self.room.is_empty() {
                idle_deadline.or_else(|| Some(tokio::time::Instant::now() + grace))
            } else {
                None
            };
        }

        tracing::debug!(room = %self.room.id(), "room coordinator stopped");
    }

    fn enqueue(&mut self, msg: RoomMsg) {
        match msg {
            // Control messages bypass the fair shares.
            RoomMsg::Attach { session, user_id, egress, reply } => {
                self.handle_attach(session, &user_id, egress, reply);
            },
            RoomMsg::Detach { session } => {
                self.room.detach(session);
                self.egress.remove(&session);
                self.update_session_gauge();
            },
            RoomMsg::Resync { session } => {
                let now = self.shared.env.now_ms();
                match self.room.resync(session) {
                    Ok(actions) => self.execute(actions, now),
                    Err(err) => {
                        tracing::warn!(room = %self.room.id(), session, error = %err, "resync failed");
                    },
                }
            },
            RoomMsg::FullSync { reply } => {
                match self.cold_replay() {
                    Ok(replayed) => {
                        tracing::info!(room = %self.room.id(), replayed,
                            "full sync rebuilt document from op store");
                    },
                    Err(err) => {
                        tracing::error!(room = %self.room.id(), error = %err, "full sync failed");
                    },
                }
                let _ = reply.send(());
            },
            RoomMsg::Inspect { reply } => {
                let _ = reply.send(RoomInspect {
                    presence: self.room.presence_snapshot(),
                    storage: self.room.storage_snapshot(),
                    sessions: self.room.session_count(),
                });
            },

            // Data messages go through the weighted fair queues.
            msg @ RoomMsg::Presence { .. } => self.presence_q.push_back(msg),
            msg @ RoomMsg::Storage { .. } => self.storage_q.push_back(msg),
            msg @ RoomMsg::Peer { .. } => {
                let is_presence = matches!(
                    &msg,
                    RoomMsg::Peer { entry: StreamEntry { record: StreamRecord::Presence { .. }, .. } }
                );
                if is_presence {
                    self.presence_q.push_back(msg);
                } else {
                    self.storage_q.push_back(msg);
                }
            },
        }
    }

    /// Process one quantum: presence and storage each get their minimum
    /// share, interleaved 2:3 so neither class waits for the other's
    /// whole share.
    fn process_quantum(&mut self) {
        let mut presence_budget = PRESENCE_SHARE;
        let mut storage_budget = STORAGE_SHARE;

        loop {
            let mut progressed = false;

            for _ in 0..2 {
                if presence_budget > 0 {
                    if let Some(msg) = self.presence_q.pop_front() {
                        self.dispatch(msg);
                        presence_budget -= 1;
                        progressed = true;
                    }
                }
            }
            for _ in 0..3 {
                if storage_budget > 0 {
                    if let Some(msg) = self.storage_q.pop_front() {
                        self.dispatch(msg);
                        storage_budget -= 1;
                        progressed = true;
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        let now = self.shared.env.now_ms();
        self.flush_stream(now);
    }

    fn dispatch(&mut self, msg: RoomMsg) {
        let now = self.shared.env.now_ms();
        match msg {
            RoomMsg::Presence { session, update } => {
                match self.room.local_presence(session, &update, now) {
                    Ok(actions) => self.execute(actions, now),
                    Err(err) => {
                        tracing::debug!(room = %self.room.id(), session, error = %err,
                            "presence diff rejected");
                    },
                }
            },
            RoomMsg::Storage { session, bytes } => self.handle_storage(session, &bytes, now),
            RoomMsg::Peer { entry } => {
                let (outcome, actions) = self.room.peer_entry(&entry);
                match outcome {
                    PeerOutcome::Applied => {
                        if matches!(entry.record, StreamRecord::Storage { .. }) {
                            self.shared.metrics.storage_ops_applied.inc();
                        }
                    },
                    PeerOutcome::Deduplicated => {
                        if matches!(entry.record, StreamRecord::Presence { .. }) {
                            self.shared.metrics.presence_diffs_dedup_dropped.inc();
                        }
                    },
                    PeerOutcome::OwnEcho => {},
                }
                self.execute(actions, now);
            },
            // Control messages never land in the data queues.
            _ => unreachable!("control message in data queue"),
        }
    }

    fn handle_attach(
        &mut self,
        session: SessionId,
        user_id: &str,
        egress: EgressHandle,
        reply: oneshot::Sender<Result<(), RoomError>>,
    ) {
        let now = self.shared.env.now_ms();
        match self.room.attach(session, user_id) {
            Ok(actions) => {
                self.egress.insert(session, egress);
                self.execute(actions, now);
                self.update_session_gauge();
                let _ = reply.send(Ok(()));
            },
            Err(err) => {
                let _ = reply.send(Err(err));
            },
        }
    }

    fn handle_storage(&mut self, session: SessionId, bytes: &Bytes, now: u64) {
        if self.read_only_until.is_some_and(|until| now < until) {
            self.refuse_storage(session, now);
            return;
        }
        self.read_only_until = None;

        let room_id = self.room.id().as_str().to_string();
        let ts = self.shared.env.wall_clock_ms();

        match self.shared.store.append(&room_id, &self.shared.config.pod_id, bytes, ts) {
            Ok(seq) => {
                self.backoff_attempts = 0;
                self.shared.metrics.storage_ops_persisted.inc();

                match self.room.storage_durable(Some(session), seq, bytes) {
                    Ok(actions) => {
                        self.shared.metrics.storage_ops_applied.inc();
                        self.execute(actions, now);
                    },
                    Err(err) => {
                        // The op is durable but inert; replicas will skip
                        // it the same way.
                        tracing::warn!(room = %room_id, seq, error = %err,
                            "kernel rejected durable op");
                    },
                }
            },
            Err(OpStoreError::Conflict { expected, got }) => {
                // Another writer owns the room's tail; back off and let
                // the retry assign past the foreign records.
                tracing::error!(room = %room_id, expected, got, "op sequence conflict");
                self.enter_backoff(now);
                self.refuse_storage(session, now);
            },
            Err(err) => {
                tracing::warn!(room = %room_id, error = %err, "op store append failed");
                self.enter_backoff(now);
                self.refuse_storage(session, now);
            },
        }
    }

    fn refuse_storage(&mut self, session: SessionId, now: u64) {
        let frame =
            ErrorPayload::new(ErrorCode::TemporarilyReadOnly, "storage temporarily unavailable")
                .to_frame();
        self.send_to(session, frame, now);
    }

    fn enter_backoff(&mut self, now: u64) {
        let delay = self.policy.delay(self.backoff_attempts, self.shared.env.random_u64());
        self.backoff_attempts = self.backoff_attempts.saturating_add(1);
        self.read_only_until = Some(now + u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
    }

    fn execute(&mut self, actions: Vec<RoomAction>, now: u64) {
        for action in actions {
            match action {
                RoomAction::Send { session, frame } => self.send_to(session, frame, now),
                RoomAction::Broadcast { frame, exclude, class } => {
                    self.broadcast(frame, exclude, &class, now);
                },
                RoomAction::AppendStream { entry } => match entry.encode() {
                    Ok(payload) => self.pending_stream.push_back(payload),
                    Err(err) => {
                        tracing::error!(room = %self.room.id(), error = %err,
                            "stream entry encode failed");
                    },
                },
            }
        }
    }

    fn send_to(&mut self, session: SessionId, frame: Frame, now: u64) {
        if let Some(handle) = self.egress.get(&session) {
            let kind = frame_label(&frame);
            handle.push(frame, EgressClass::Reliable, now);
            self.shared.metrics.frames_out.inc(kind);
        }
    }

    fn broadcast(
        &mut self,
        frame: Frame,
        exclude: Option<SessionId>,
        class: &EgressClass,
        now: u64,
    ) {
        let kind = frame_label(&frame);
        let metrics = &self.shared.metrics;

        for (session, handle) in &self.egress {
            if Some(*session) == exclude {
                continue;
            }

            let outcome = handle.push(frame.clone(), class.clone(), now);
            metrics.frames_out.inc(kind);

            if outcome.coalesced > 0 {
                metrics.egress_drops.add("presence_coalesce", outcome.coalesced);
            }
            if outcome.shed > 0 {
                metrics.egress_drops.add("presence_shed", outcome.shed);
            }
        }
    }

    /// Push pending entries to the stream provider; on failure keep them
    /// queued and refuse storage until the backoff expires.
    fn flush_stream(&mut self, now: u64) {
        if self.pending_stream.is_empty() {
            return;
        }
        if self.read_only_until.is_some_and(|until| now < until) {
            return;
        }

        let stream = stream_name(self.room.id().as_str());
        while let Some(payload) = self.pending_stream.front() {
            match self.shared.stream.append(&stream, payload) {
                Ok(_) => {
                    self.pending_stream.pop_front();
                    self.backoff_attempts = 0;
                },
                Err(err) => {
                    tracing::warn!(room = %self.room.id(), error = %err, "stream append failed");
                    self.enter_backoff(now);
                    break;
                },
            }
        }
    }

    fn update_session_gauge(&self) {
        self.shared
            .metrics
            .active_sessions
            .set(self.room.id().as_str(), self.room.session_count() as u64);
    }
}

fn frame_label(frame: &Frame) -> &'static str {
    match frame.kind {
        syncpod_proto::FrameKind::PresenceDiff => "presence_diff",
        syncpod_proto::FrameKind::StorageUpdate => "storage_update",
        syncpod_proto::FrameKind::PresenceSync => "presence_sync",
        syncpod_proto::FrameKind::StorageSync => "storage_sync",
        syncpod_proto::FrameKind::Error => "error",
        syncpod_proto::FrameKind::Control => "control",
    }
}
