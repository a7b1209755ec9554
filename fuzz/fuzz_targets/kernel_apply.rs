//! Fuzz target for the CRDT kernel
//!
//! Applies arbitrary update bytes and checks the kernel contract on the
//! ones that parse: a snapshot taken after an apply must itself be a
//! valid update that replays to the same snapshot.
//!
//! The fuzzer should NEVER panic: malformed updates return an error and
//! leave the kernel untouched.

#![no_main]

use libfuzzer_sys::fuzz_target;
use syncpod_core::crdt::{CrdtDoc, DeltaSetKernel};

fuzz_target!(|data: &[u8]| {
    let mut doc = CrdtDoc::<DeltaSetKernel>::new();

    if doc.apply(data).is_ok() {
        // Idempotence: a duplicate apply cannot change the state.
        let snapshot = doc.snapshot();
        doc.apply(data).expect("valid update re-applies");
        assert_eq!(doc.snapshot(), snapshot);

        // Snapshots are self-contained updates.
        let mut replay = CrdtDoc::<DeltaSetKernel>::new();
        replay.apply(&snapshot).expect("snapshot is a valid update");
        assert_eq!(replay.snapshot(), snapshot);
    }
});
