//! Health and metrics HTTP surface.
//!
//! `GET /health` → 200 when the room registry is responsive, the op
//! store is reachable, and no room's stream lag exceeds the retention
//! cap; 503 otherwise. `GET /metrics` → Prometheus text exposition.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use syncpod_core::Environment;

use crate::{registry::RoomRegistry, store::OpStore, stream::StreamLog, PodShared};

/// Shared state for the HTTP handlers.
pub struct HttpState<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    /// Pod-wide shared context.
    pub shared: PodShared<S, L, E>,
    /// Room registry, probed for responsiveness.
    pub registry: RoomRegistry<S, L, E>,
}

impl<S, L, E> Clone for HttpState<S, L, E>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone(), registry: self.registry.clone() }
    }
}

/// Build the router.
pub fn router<S, L, E>(state: HttpState<S, L, E>) -> Router
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    Router::new()
        .route("/health", get(health::<S, L, E>))
        .route("/metrics", get(metrics::<S, L, E>))
        .with_state(Arc::new(state))
}

async fn health<S, L, E>(State(state): State<Arc<HttpState<S, L, E>>>) -> (StatusCode, &'static str)
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    // Registry responsive: the room map answers within a short deadline.
    let registry_ok = tokio::time::timeout(
        std::time::Duration::from_millis(250),
        state.registry.room_count(),
    )
    .await
    .is_ok();

    let store_ok = state.shared.store.ping().is_ok();

    let lag_threshold = state.shared.config.stream_max_entries as u64;
    let lag_ok = state.shared.metrics.stream_lag_entries.max() < lag_threshold;

    if registry_ok && store_ok && lag_ok {
        (StatusCode::OK, "ok\n")
    } else {
        tracing::warn!(registry_ok, store_ok, lag_ok, "health check failed");
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy\n")
    }
}

async fn metrics<S, L, E>(State(state): State<Arc<HttpState<S, L, E>>>) -> String
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    state.shared.metrics.render_prometheus()
}
