//! Room registry.
//!
//! Thread-safe map of room id → coordinator handle. Rooms materialize
//! lazily on first attach (creation is double-checked under the write
//! lock, so one instance per id) and destroy themselves after the idle
//! grace period; the registry retries an attach that races a dying
//! coordinator. A per-pod room cap surfaces as `TooManyRooms` for
//! admission backpressure at the edge.

use std::{collections::HashMap, sync::Arc, time::Duration};

use syncpod_core::{backoff::RetryPolicy, Environment, Room, RoomError, RoomId, SessionId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::{
    coordinator::{Coordinator, RoomInspect, RoomMsg},
    hub::EgressHandle,
    store::OpStore,
    stream::{BatchOutcome, StreamBridge, StreamLog},
    Kernel, PodShared,
};

/// Coordinator inbox depth. Senders briefly queue behind a full inbox;
/// the coordinator drains in quanta so the bound is rarely felt.
const INBOX_DEPTH: usize = 1024;

/// How many stream entries one bridge poll may deliver.
const BRIDGE_BATCH: usize = 64;

/// Bridge poll timeout; also bounds shutdown latency of the bridge task.
const BRIDGE_POLL: Duration = Duration::from_millis(250);

/// Errors surfaced at attach time.
#[derive(Error, Debug)]
pub enum AttachError {
    /// The pod's room cap is reached.
    #[error("too many rooms on this pod (cap {cap})")]
    TooManyRooms {
        /// Configured cap
        cap: usize,
    },

    /// The room rejected the attach (capacity).
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Pod is shutting down; no new rooms or sessions.
    #[error("pod is shutting down")]
    Shutdown,
}

/// Cloneable handle to one room's coordinator.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    tx: mpsc::Sender<RoomMsg>,
    generation: u64,
}

impl RoomHandle {
    /// Send a message to the coordinator. `false` if it is gone.
    pub async fn send(&self, msg: RoomMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    /// Consistent room snapshot (tests and health).
    pub async fn inspect(&self) -> Option<RoomInspect> {
        let (reply, rx) = oneshot::channel();
        if !self.send(RoomMsg::Inspect { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}

/// The registry itself. Clone shares the map.
pub struct RoomRegistry<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    rooms: Arc<RwLock<HashMap<RoomId, RoomHandle>>>,
    shared: PodShared<S, L, E>,
    generations: Arc<std::sync::atomic::AtomicU64>,
}

impl<S, L, E> Clone for RoomRegistry<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    fn clone(&self) -> Self {
        Self {
            rooms: Arc::clone(&self.rooms),
            shared: self.shared.clone(),
            generations: Arc::clone(&self.generations),
        }
    }
}

impl<S, L, E> RoomRegistry<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    /// Empty registry.
    pub fn new(shared: PodShared<S, L, E>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            shared,
            generations: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Rooms currently materialized.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Handle for an already-materialized room.
    pub async fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Attach a session, materializing the room if needed. Returns the
    /// room handle once the coordinator has queued the initial sync.
    ///
    /// # Errors
    ///
    /// See [`AttachError`].
    pub async fn attach(
        &self,
        room_id: &RoomId,
        session: SessionId,
        user_id: &str,
        egress: EgressHandle,
    ) -> Result<RoomHandle, AttachError> {
        if *self.shared.shutdown.borrow() {
            return Err(AttachError::Shutdown);
        }

        loop {
            let handle = self.get_or_spawn(room_id).await?;

            let (reply, rx) = oneshot::channel();
            let msg = RoomMsg::Attach {
                session,
                user_id: user_id.to_string(),
                egress: egress.clone(),
                reply,
            };

            if !handle.send(msg).await {
                // Raced an idle destruction; drop the stale handle and
                // try again.
                self.remove_if(room_id, handle.generation).await;
                continue;
            }

            return match rx.await {
                Ok(Ok(())) => Ok(handle),
                Ok(Err(err)) => Err(AttachError::Room(err)),
                Err(_) => {
                    self.remove_if(room_id, handle.generation).await;
                    continue;
                },
            };
        }
    }

    /// Detach a session from a room. No-op if the room is gone.
    pub async fn detach(&self, room_id: &RoomId, session: SessionId) {
        if let Some(handle) = self.get(room_id).await {
            let _ = handle.send(RoomMsg::Detach { session }).await;
        }
    }

    async fn get_or_spawn(&self, room_id: &RoomId) -> Result<RoomHandle, AttachError> {
        if let Some(handle) = self.rooms.read().await.get(room_id).cloned() {
            return Ok(handle);
        }

        let mut rooms = self.rooms.write().await;
        // Double-check: another attach may have created it while we
        // waited for the write lock.
        if let Some(handle) = rooms.get(room_id).cloned() {
            return Ok(handle);
        }

        if rooms.len() >= self.shared.config.max_rooms {
            return Err(AttachError::TooManyRooms { cap: self.shared.config.max_rooms });
        }

        let handle = self.spawn_room(room_id.clone());
        rooms.insert(room_id.clone(), handle.clone());
        self.shared.metrics.active_rooms.set(rooms.len() as u64);

        Ok(handle)
    }

    fn spawn_room(&self, room_id: RoomId) -> RoomHandle {
        let generation =
            self.generations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let handle = RoomHandle { tx: tx.clone(), generation };

        let shared = self.shared.clone();
        let room = Room::<Kernel>::new(
            room_id.clone(),
            shared.config.pod_id.clone(),
            shared.config.room_config(),
        );

        // Seed the bridge cursor before replay starts: entries streamed
        // after this point are consumed live, everything earlier is
        // covered by the op-store replay.
        let mut bridge = StreamBridge::new(shared.stream.clone(), room_id.as_str());
        if let Err(err) = bridge.seed_to_head() {
            tracing::warn!(room = %room_id, error = %err, "bridge seed failed; will retry");
        }

        tokio::spawn(run_bridge(bridge, room_id.clone(), tx, shared.clone()));

        let registry = self.clone();
        let coordinator = Coordinator::new(room, rx, shared);
        tokio::spawn(async move {
            let mut coordinator = coordinator;
            coordinator.activate();
            coordinator.run().await;
            registry.remove_if(&room_id, generation).await;
        });

        handle
    }

    async fn remove_if(&self, room_id: &RoomId, generation: u64) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|h| h.generation == generation) {
            rooms.remove(room_id);
            self.shared.metrics.active_rooms.set(rooms.len() as u64);
            self.shared.metrics.active_sessions.remove(room_id.as_str());
            self.shared.metrics.stream_lag_entries.remove(room_id.as_str());
        }
    }
}

/// Per-room stream consumer task: advances the peer cursor and feeds
/// entries into the coordinator inbox. Exits when the coordinator is
/// gone or the pod shuts down.
async fn run_bridge<S, L, E>(
    mut bridge: StreamBridge<L>,
    room_id: RoomId,
    coordinator: mpsc::Sender<RoomMsg>,
    shared: PodShared<S, L, E>,
) where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    let policy = RetryPolicy::default();
    let mut attempts: u32 = 0;
    let mut shutdown = shared.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = tokio::select! {
            outcome = bridge.next_batch(BRIDGE_BATCH, BRIDGE_POLL) => outcome,
            _ = shutdown.changed() => break,
        };

        match outcome {
            Ok(BatchOutcome::Entries(entries)) => {
                attempts = 0;
                for entry in entries {
                    if coordinator.send(RoomMsg::Peer { entry }).await.is_err() {
                        return;
                    }
                }
            },
            Ok(BatchOutcome::Empty) => {
                attempts = 0;
            },
            Ok(BatchOutcome::Gap { oldest }) => {
                tracing::warn!(room = %room_id, cursor = bridge.cursor(), oldest,
                    "stream cursor fell behind retention; full sync");

                let (reply, rx) = oneshot::channel();
                if coordinator.send(RoomMsg::FullSync { reply }).await.is_err() {
                    return;
                }
                if rx.await.is_err() {
                    return;
                }
                if let Err(err) = bridge.seed_to_head() {
                    tracing::warn!(room = %room_id, error = %err, "post-sync seed failed");
                }
            },
            Err(err) => {
                tracing::warn!(room = %room_id, error = %err, "stream read failed");
                let delay = policy.delay(attempts, shared.env.random_u64());
                attempts = attempts.saturating_add(1);
                shared.env.sleep(delay).await;
            },
        }

        let lag = bridge.lag().unwrap_or(0);
        shared.metrics.stream_lag_entries.set(room_id.as_str(), lag);
    }
}
