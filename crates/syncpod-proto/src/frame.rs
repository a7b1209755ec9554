//! Frame codec: one-byte type tag + payload.
//!
//! The transport preserves message boundaries, so a frame needs no length
//! prefix of its own: the first byte is the [`FrameKind`] tag and the rest
//! is the payload. The codec validates the tag and the size bound; payload
//! contents are validated later by whichever component owns that kind.

use bytes::{BufMut, Bytes};

use crate::errors::ProtocolError;

/// Maximum payload size per frame (1 MiB).
///
/// Storage updates dominate frame sizes; presence diffs are capped far
/// lower by the presence table itself (2 KiB encoded field bag).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Frame type tags.
///
/// Client→server: `PresenceDiff`, `StorageUpdate`, `Control`.
/// Server→client additionally: `PresenceSync`, `StorageSync`, `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Partial presence overwrite for one user (CBOR).
    PresenceDiff = 0x01,
    /// Opaque CRDT update bytes.
    StorageUpdate = 0x02,
    /// Full presence snapshot, sent at session start and on resync.
    PresenceSync = 0x20,
    /// Full CRDT snapshot, sent once at session start.
    StorageSync = 0x21,
    /// Error report: `code:u16 | message:utf8`.
    Error = 0x7E,
    /// Control channel: `subtype:u8 | ...` (ping, pong, drain, resync).
    Control = 0x7F,
}

impl FrameKind {
    /// Parse a frame kind from its wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::PresenceDiff),
            0x02 => Some(Self::StorageUpdate),
            0x20 => Some(Self::PresenceSync),
            0x21 => Some(Self::StorageSync),
            0x7E => Some(Self::Error),
            0x7F => Some(Self::Control),
            _ => None,
        }
    }

    /// Wire tag for this kind.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether clients are allowed to send this kind.
    ///
    /// Sync frames flow server→client only; receiving one from a client is
    /// a protocol violation.
    #[must_use]
    pub fn client_sendable(self) -> bool {
        !matches!(self, Self::PresenceSync | Self::StorageSync)
    }
}

/// One wire frame: type tag plus raw payload bytes.
///
/// Holds raw bytes, not decoded payloads, so routing never pays for
/// deserialization. `Bytes` makes clones cheap (refcount bump) which the
/// hub relies on when fanning a frame out to many sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type tag.
    pub kind: FrameKind,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a kind and payload.
    #[must_use]
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self { kind, payload: payload.into() }
    }

    /// Total encoded size in bytes (tag + payload).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Encode into a buffer as `tag | payload`.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`]. This is the enforcement point for the bound;
    /// construction stays unchecked so tests can build oversized frames.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.put_u8(self.kind.to_u8());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh `Vec<u8>`.
    ///
    /// # Errors
    ///
    /// Same as [`Frame::encode`].
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a frame from one transport message.
    ///
    /// Validation happens before the payload is copied: an empty message,
    /// an unknown tag, or an oversized payload are all rejected without
    /// allocation.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyFrame` if the message has no tag byte
    /// - `ProtocolError::UnknownKind` for unrecognized tags
    /// - `ProtocolError::PayloadTooLarge` past [`MAX_PAYLOAD_SIZE`]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;

        let kind = FrameKind::from_u8(tag).ok_or(ProtocolError::UnknownKind(tag))?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self { kind, payload: Bytes::copy_from_slice(payload) })
    }
}
