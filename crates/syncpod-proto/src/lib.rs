//! Wire protocol for the syncpod collaboration pod.
//!
//! A session exchanges binary frames over any transport that preserves
//! message boundaries. Each frame is a one-byte type tag followed by the
//! payload. Presence payloads are compact self-describing CBOR; storage
//! payloads are opaque CRDT bytes that the pod never interprets.
//!
//! The crate has three layers:
//!
//! - [`Frame`] / [`FrameKind`]: the transport-level tag + bytes split.
//!   Routing happens on the tag alone, without touching the payload.
//! - [`payload`]: typed CBOR payloads (presence diffs, snapshots, errors,
//!   control messages). Decoded only by the component that owns them.
//! - [`stream`]: entries of the replicated per-room log that pods use to
//!   exchange updates, tagged with their origin pod.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod frame;
pub mod payload;
pub mod stream;

pub use errors::ProtocolError;
pub use frame::{Frame, FrameKind, MAX_PAYLOAD_SIZE};
pub use payload::{
    ControlMsg, ErrorCode, ErrorPayload, PresenceEntryWire, PresenceSnapshot, PresenceUpdate,
};
pub use stream::{StreamEntry, StreamOrigin, StreamRecord};

/// Convenience result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
