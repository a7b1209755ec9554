//! Typed frame payloads.
//!
//! Presence traffic uses compact self-describing CBOR: the field bag is a
//! free-form map, but it travels inside a typed record so every consumer
//! agrees on the envelope (`user_id`, `fields`, `source_ts`). Error and
//! control payloads are small fixed binary layouts that need no CBOR.
//! Storage payloads never appear here: they are opaque bytes end to end.

use std::collections::BTreeMap;

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::{errors::ProtocolError, Frame, FrameKind};

/// Maximum encoded size of a presence field bag (2 KiB).
///
/// Enforced when a diff is applied, not at the codec: an oversized bag is
/// a malformed frame for accounting purposes but must not kill decoding of
/// the envelope.
pub const MAX_FIELDS_BYTES: usize = 2 * 1024;

/// A presence diff: partial overwrite of one user's entry.
///
/// - From clients, `user_id` and `source_ts` are ignored; the pod derives
///   the user from the session token and stamps the time itself.
/// - Rebroadcast diffs and peer-stream diffs carry both filled in.
/// - `fields: None` is a tombstone: the user's entry is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Subject user. `None` only in the client→pod direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Partial field bag; named fields replace, absent fields persist.
    /// `None` removes the entry entirely.
    pub fields: Option<BTreeMap<String, Value>>,
    /// Server-stamped origin time (monotonic ms at the stamping pod).
    /// Peers reject diffs older than the entry they already hold.
    #[serde(default)]
    pub source_ts: u64,
}

impl PresenceUpdate {
    /// Diff that overwrites the given fields.
    #[must_use]
    pub fn set(user_id: impl Into<String>, fields: BTreeMap<String, Value>, source_ts: u64) -> Self {
        Self { user_id: Some(user_id.into()), fields: Some(fields), source_ts }
    }

    /// Tombstone diff removing the user's entry.
    #[must_use]
    pub fn tombstone(user_id: impl Into<String>, source_ts: u64) -> Self {
        Self { user_id: Some(user_id.into()), fields: None, source_ts }
    }

    /// Whether this diff removes the entry.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_none()
    }

    /// Encode as a `PresenceDiff` frame.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` if CBOR serialization fails.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(FrameKind::PresenceDiff, encode_cbor(self)?))
    }

    /// Decode from a `PresenceDiff` frame payload.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` on malformed CBOR.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        decode_cbor(payload)
    }
}

/// One entry of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntryWire {
    /// Subject user.
    pub user_id: String,
    /// Full current field bag.
    pub fields: BTreeMap<String, Value>,
    /// Server-stamped last activity (monotonic ms).
    pub last_active: u64,
}

/// Full presence snapshot of a room, sent as `PresenceSync`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// All live entries, in no particular order.
    pub entries: Vec<PresenceEntryWire>,
}

impl PresenceSnapshot {
    /// Encode as a `PresenceSync` frame.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` if CBOR serialization fails.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(FrameKind::PresenceSync, encode_cbor(self)?))
    }

    /// Decode from a `PresenceSync` frame payload.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPayload` on malformed CBOR.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        decode_cbor(payload)
    }
}

/// Error codes carried in `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Session token failed verification.
    Unauthorized = 0x0001,
    /// Repeated malformed frames; session is closed.
    ProtocolViolation = 0x0002,
    /// Per-session frame budget exceeded; frame dropped.
    RateLimited = 0x0003,
    /// Egress stayed full past the slow-client timeout.
    SlowConsumer = 0x0004,
    /// Op store unavailable; storage writes are refused for now.
    TemporarilyReadOnly = 0x0005,
    /// Room has reached its session cap.
    RoomCapacityExceeded = 0x0006,
    /// Pod has reached its room cap.
    TooManyRooms = 0x0007,
    /// Pod is shutting down.
    Shutdown = 0x0008,
}

impl ErrorCode {
    /// Parse from the wire value.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::Unauthorized),
            0x0002 => Some(Self::ProtocolViolation),
            0x0003 => Some(Self::RateLimited),
            0x0004 => Some(Self::SlowConsumer),
            0x0005 => Some(Self::TemporarilyReadOnly),
            0x0006 => Some(Self::RoomCapacityExceeded),
            0x0007 => Some(Self::TooManyRooms),
            0x0008 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Error payload: `code:u16 BE | message:utf8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Error code (see [`ErrorCode`]).
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build from a known code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code as u16, message: message.into() }
    }

    /// Encode as an `Error` frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut buf = Vec::with_capacity(2 + self.message.len());
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        Frame::new(FrameKind::Error, buf)
    }

    /// Decode from an `Error` frame payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTruncated` if shorter than the code prefix
    /// - `ProtocolError::InvalidPayload` if the message is not UTF-8
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::PayloadTruncated { expected: 2, actual: payload.len() });
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let message = std::str::from_utf8(&payload[2..])
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?
            .to_string();

        Ok(Self { code, message })
    }
}

/// Control messages: `subtype:u8 | ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Keepalive probe, pod→client every heartbeat interval.
    Ping,
    /// Keepalive response.
    Pong,
    /// Pod is draining; the client should finish up and reconnect elsewhere.
    Drain,
    /// Client requests a fresh presence snapshot.
    Resync,
}

impl ControlMsg {
    const PING: u8 = 0x01;
    const PONG: u8 = 0x02;
    const DRAIN: u8 = 0x03;
    const RESYNC: u8 = 0x04;

    /// Encode as a `Control` frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let subtype = match self {
            Self::Ping => Self::PING,
            Self::Pong => Self::PONG,
            Self::Drain => Self::DRAIN,
            Self::Resync => Self::RESYNC,
        };
        Frame::new(FrameKind::Control, Bytes::copy_from_slice(&[subtype]))
    }

    /// Decode from a `Control` frame payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTruncated` on an empty payload
    /// - `ProtocolError::InvalidPayload` for unknown subtypes
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let subtype =
            *payload.first().ok_or(ProtocolError::PayloadTruncated { expected: 1, actual: 0 })?;

        match subtype {
            Self::PING => Ok(Self::Ping),
            Self::PONG => Ok(Self::Pong),
            Self::DRAIN => Ok(Self::Drain),
            Self::RESYNC => Ok(Self::Resync),
            other => Err(ProtocolError::InvalidPayload(format!(
                "unknown control subtype {other:#04x}"
            ))),
        }
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}
