//! Fuzz target for Frame::decode
//!
//! Feeds arbitrary byte sequences to the frame codec to find:
//! - Parser crashes or panics
//! - Integer overflows in size calculations
//! - Buffer over-reads
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use syncpod_proto::Frame;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes either decode into a frame or return Err; never panic.
    if let Ok(frame) = Frame::decode(data) {
        // A successfully decoded frame must re-encode.
        let _ = frame.to_vec();
    }
});
