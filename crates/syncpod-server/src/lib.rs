//! The syncpod collaboration pod.
//!
//! Terminates client sessions, keeps per-room in-memory state (presence
//! table + CRDT document), fans updates out to local subscribers and to
//! peer pods through a replicated per-room stream, and persists the
//! CRDT op history so a cold pod can reconstruct room state.
//!
//! # Architecture
//!
//! The protocol logic lives in `syncpod-core` as pure state machines;
//! this crate is the production glue:
//!
//! - [`registry::RoomRegistry`]: room id → coordinator handle, lazy
//!   materialization, idle destruction, room cap
//! - [`coordinator`]: one serial task per room owning all room state
//! - [`socket`]: WebSocket session ingress/egress
//! - [`stream`]: the replicated per-room log and its consuming bridge
//! - [`store`]: durable op history (redb in production)
//! - [`http`]: `/health` and `/metrics`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
mod error;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod sim_env;
pub mod socket;
pub mod store;
pub mod stream;
pub mod system_env;

use std::sync::Arc;

pub use error::PodError;
pub use sim_env::SimEnv;
use syncpod_core::Environment;
pub use system_env::SystemEnv;
use tokio::sync::watch;

use crate::{config::PodConfig, metrics::PodMetrics, store::OpStore, stream::StreamLog};

/// CRDT kernel selected at build time.
pub type Kernel = syncpod_core::crdt::DeltaSetKernel;

/// Context shared by every task on the pod.
pub struct PodShared<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    /// Pod configuration.
    pub config: Arc<PodConfig>,
    /// Time and entropy.
    pub env: E,
    /// Counters and gauges.
    pub metrics: Arc<PodMetrics>,
    /// Durable op history.
    pub store: S,
    /// Replicated per-room stream provider.
    pub stream: L,
    /// Flips to `true` exactly once, at shutdown.
    pub shutdown: watch::Receiver<bool>,
}

impl<S, L, E> Clone for PodShared<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            env: self.env.clone(),
            metrics: Arc::clone(&self.metrics),
            store: self.store.clone(),
            stream: self.stream.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S, L, E> PodShared<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    /// Assemble the shared context. Returns the sender half of the
    /// shutdown signal for the lifecycle owner.
    pub fn new(
        config: PodConfig,
        env: E,
        store: S,
        stream: L,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown) = watch::channel(false);
        (
            Self {
                config: Arc::new(config),
                env,
                metrics: Arc::new(PodMetrics::default()),
                store,
                stream,
                shutdown,
            },
            shutdown_tx,
        )
    }
}
