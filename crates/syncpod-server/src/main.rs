//! Pod binary.
//!
//! Configuration comes from the environment (see `config`); exit codes:
//! 0 clean shutdown, 64 configuration error, 69 upstream dependency
//! unreachable at startup, 70 unrecoverable internal error.

use syncpod_server::{
    config::{exit_code, PodConfig},
    http::{self, HttpState},
    registry::RoomRegistry,
    socket,
    store::{MemoryOpStore, OpStore, RedbOpStore},
    stream::MemoryStreamLog,
    PodShared, SystemEnv,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = match PodConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(exit_code::CONFIG);
        },
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            std::process::exit(exit_code::INTERNAL);
        },
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: PodConfig) -> i32 {
    // The stream provider is selected by URL scheme; this build ships
    // the in-process provider.
    let stream = match config.stream_url.split_once("://") {
        Some(("mem", _)) | None => MemoryStreamLog::new(config.stream_max_entries),
        Some((scheme, _)) => {
            tracing::error!(scheme, "unsupported stream provider");
            return exit_code::CONFIG;
        },
    };

    match config.op_store_url.clone() {
        url if url.starts_with("mem://") => {
            tracing::warn!("op store is in-memory; ops will not survive a restart");
            serve(config, MemoryOpStore::new(), stream).await
        },
        url => {
            let path = url.strip_prefix("redb:").unwrap_or(&url);
            match RedbOpStore::open(path) {
                Ok(store) => serve(config, store, stream).await,
                Err(err) => {
                    tracing::error!(path, error = %err, "op store unreachable");
                    exit_code::UNAVAILABLE
                },
            }
        },
    }
}

async fn serve<S: OpStore>(config: PodConfig, store: S, stream: MemoryStreamLog) -> i32 {
    if let Err(err) = store.ping() {
        tracing::error!(error = %err, "op store failed startup probe");
        return exit_code::UNAVAILABLE;
    }

    let drain_timeout = config.drain_timeout;
    let listen_addr = config.listen_addr.clone();
    let http_addr = config.http_addr.clone();
    let pod_id = config.pod_id.clone();

    let (shared, shutdown_tx) = PodShared::new(config, SystemEnv::new(), store, stream);
    let registry = RoomRegistry::new(shared.clone());

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %listen_addr, error = %err, "failed to bind session listener");
            return exit_code::UNAVAILABLE;
        },
    };

    let http_listener = match tokio::net::TcpListener::bind(&http_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %http_addr, error = %err, "failed to bind http listener");
            return exit_code::UNAVAILABLE;
        },
    };

    tracing::info!(pod_id = %pod_id, sessions = %listen_addr, http = %http_addr, "pod up");

    let http_state = HttpState { shared: shared.clone(), registry: registry.clone() };
    tokio::spawn(async move {
        if let Err(err) = axum::serve(http_listener, http::router(http_state)).await {
            tracing::error!(error = %err, "http server failed");
        }
    });

    tokio::spawn(socket::run_listener(listener, registry, shared.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => {
            tracing::error!(error = %err, "signal handler failed");
            return exit_code::INTERNAL;
        },
    }

    // Stop accepting, drain every session, give egress up to the drain
    // timeout to flush.
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while tokio::time::Instant::now() < deadline {
        if shared.metrics.active_sessions.max() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    tracing::info!("pod stopped");
    exit_code::OK
}
