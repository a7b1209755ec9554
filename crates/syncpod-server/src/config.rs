//! Pod configuration from environment variables.
//!
//! Every knob has the default from the service contract; unparseable
//! values are configuration errors and the process exits with code 64
//! before binding anything.

use std::time::Duration;

use syncpod_core::{session::SessionConfig, RoomConfig};
use thiserror::Error;

/// Configuration failure, fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable was present but unparseable.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Complete pod configuration.
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// Stable identifier used for stream origin tagging (`POD_ID`).
    pub pod_id: String,
    /// Session transport bind address (`LISTEN_ADDR`).
    pub listen_addr: String,
    /// Health/metrics HTTP bind address (`HTTP_ADDR`).
    pub http_addr: String,
    /// HMAC secret for session token verification (`EDGE_TOKEN_SECRET`).
    pub token_secret: Vec<u8>,
    /// Stream provider endpoint (`STREAM_URL`), e.g. `mem://local`.
    pub stream_url: String,
    /// Op store endpoint (`OP_STORE_URL`), e.g. `redb:/var/lib/syncpod/ops.redb`.
    pub op_store_url: String,
    /// Grace before an empty room is destroyed (`IDLE_ROOM_GRACE_S`).
    pub idle_room_grace: Duration,
    /// Presence entry TTL (`PRESENCE_TTL_S`).
    pub presence_ttl: Duration,
    /// Egress byte bound (`EGRESS_BYTES`).
    pub egress_bytes: usize,
    /// Egress frame bound (`EGRESS_FRAMES`).
    pub egress_frames: usize,
    /// Slow client timeout (`SLOW_CLIENT_TIMEOUT_MS`).
    pub slow_client_timeout: Duration,
    /// Drain timeout on shutdown (`DRAIN_TIMEOUT_S`).
    pub drain_timeout: Duration,
    /// Stream retention cap in entries (`STREAM_MAX_ENTRIES`).
    pub stream_max_entries: usize,
    /// Stream retention cap in seconds (`STREAM_MAX_AGE_S`).
    pub stream_max_age: Duration,
    /// Rooms allowed on this pod (`MAX_ROOMS`).
    pub max_rooms: usize,
    /// Sessions allowed per room (`MAX_SESSIONS_PER_ROOM`).
    pub max_sessions_per_room: usize,
}

impl PodConfig {
    /// Read configuration from process environment.
    ///
    /// # Errors
    ///
    /// `ConfigError` for a missing `EDGE_TOKEN_SECRET` or any
    /// unparseable numeric knob.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pod_id: var_or("POD_ID", "pod-0"),
            listen_addr: var_or("LISTEN_ADDR", "0.0.0.0:9300"),
            http_addr: var_or("HTTP_ADDR", "127.0.0.1:9301"),
            token_secret: std::env::var("EDGE_TOKEN_SECRET")
                .map(String::into_bytes)
                .map_err(|_| ConfigError::Missing("EDGE_TOKEN_SECRET"))?,
            stream_url: var_or("STREAM_URL", "mem://local"),
            op_store_url: var_or("OP_STORE_URL", "mem://local"),
            idle_room_grace: Duration::from_secs(num_or("IDLE_ROOM_GRACE_S", 60)?),
            presence_ttl: Duration::from_secs(num_or("PRESENCE_TTL_S", 120)?),
            egress_bytes: num_or("EGRESS_BYTES", 64 * 1024)? as usize,
            egress_frames: num_or("EGRESS_FRAMES", 256)? as usize,
            slow_client_timeout: Duration::from_millis(num_or("SLOW_CLIENT_TIMEOUT_MS", 1_000)?),
            drain_timeout: Duration::from_secs(num_or("DRAIN_TIMEOUT_S", 10)?),
            stream_max_entries: num_or("STREAM_MAX_ENTRIES", 1_000)? as usize,
            stream_max_age: Duration::from_secs(num_or("STREAM_MAX_AGE_S", 60)?),
            max_rooms: num_or("MAX_ROOMS", 10_000)? as usize,
            max_sessions_per_room: num_or("MAX_SESSIONS_PER_ROOM", 10_000)? as usize,
        })
    }

    /// Session limits derived from this config.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
    }

    /// Room limits derived from this config.
    #[must_use]
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            presence_ttl_ms: u64::try_from(self.presence_ttl.as_millis()).unwrap_or(u64::MAX),
            max_sessions: self.max_sessions_per_room,
        }
    }
}

fn var_or(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn num_or(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) => {
            value.parse().map_err(|_| ConfigError::Invalid { var, value })
        },
        Err(_) => Ok(default),
    }
}

/// Process exit codes.
pub mod exit_code {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Configuration error.
    pub const CONFIG: i32 = 64;
    /// Upstream dependency unreachable at startup.
    pub const UNAVAILABLE: i32 = 69;
    /// Unrecoverable internal error.
    pub const INTERNAL: i32 = 70;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; serialize them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn defaults_apply() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("EDGE_TOKEN_SECRET", "s3cret");

        let config = PodConfig::from_env().unwrap();
        assert_eq!(config.egress_bytes, 64 * 1024);
        assert_eq!(config.egress_frames, 256);
        assert_eq!(config.idle_room_grace, Duration::from_secs(60));
        assert_eq!(config.presence_ttl, Duration::from_secs(120));
        assert_eq!(config.stream_max_entries, 1_000);
    }

    #[test]
    fn missing_secret_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("EDGE_TOKEN_SECRET");

        assert!(matches!(PodConfig::from_env(), Err(ConfigError::Missing("EDGE_TOKEN_SECRET"))));
    }

    #[test]
    fn invalid_number_rejected() {
        assert!(matches!(
            num_or_probe("definitely-not-a-number"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    fn num_or_probe(value: &str) -> Result<u64, ConfigError> {
        std::env::set_var("SYNCPOD_TEST_NUM", value);
        let result = num_or("SYNCPOD_TEST_NUM", 1);
        std::env::remove_var("SYNCPOD_TEST_NUM");
        result
    }
}
