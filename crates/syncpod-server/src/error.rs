//! Runtime error type for the pod.

use std::fmt;

/// Errors surfaced by the pod runtime.
///
/// Session-local failures never propagate past the session task; this
/// type covers transport setup and dependency wiring.
#[derive(Debug)]
pub enum PodError {
    /// Socket/WebSocket error.
    Transport(String),

    /// Dependency unreachable (op store, stream provider).
    Dependency(String),

    /// Bug territory: unexpected state the pod cannot recover from.
    Internal(String),
}

impl fmt::Display for PodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Dependency(msg) => write!(f, "dependency error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PodError {}

impl From<std::io::Error> for PodError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PodError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::store::OpStoreError> for PodError {
    fn from(err: crate::store::OpStoreError) -> Self {
        Self::Dependency(err.to_string())
    }
}

impl From<crate::stream::StreamError> for PodError {
    fn from(err: crate::stream::StreamError) -> Self {
        Self::Dependency(err.to_string())
    }
}
