//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// A malformed frame is never fatal by itself: the session layer counts
/// these and only closes after repeated violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was empty (missing the type tag byte).
    #[error("empty frame: missing type tag")]
    EmptyFrame,

    /// Frame type tag is not one of the recognized values.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Payload exceeds the per-frame size limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual payload size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Payload is shorter than its fixed prefix requires.
    #[error("payload truncated: expected at least {expected} bytes, got {actual}")]
    PayloadTruncated {
        /// Minimum required payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// CBOR payload failed to decode into the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Frame kind is only valid in the server→client direction.
    #[error("frame kind {0:?} is server-to-client only")]
    DirectionViolation(crate::FrameKind),
}
