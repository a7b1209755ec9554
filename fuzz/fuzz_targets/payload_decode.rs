//! Fuzz target for typed payload decoding
//!
//! Tests the CBOR payload decoders and the fixed binary layouts with:
//! - Malformed CBOR
//! - Type confusion (bytes of one payload fed to another decoder)
//! - Oversized strings and collections
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use syncpod_proto::{ControlMsg, ErrorPayload, PresenceSnapshot, PresenceUpdate, StreamEntry};

fuzz_target!(|data: &[u8]| {
    let _ = PresenceUpdate::from_payload(data);
    let _ = PresenceSnapshot::from_payload(data);
    let _ = ErrorPayload::from_payload(data);
    let _ = ControlMsg::from_payload(data);
    let _ = StreamEntry::decode(data);
});
