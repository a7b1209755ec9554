//! Property-based tests for the core invariants.
//!
//! - CRDT convergence: any delivery order of any update multiset merges
//!   to byte-equal snapshots.
//! - Presence monotonicity: a user's `last_active` never decreases on
//!   any replica, whatever the interleaving of local and peer diffs.
//! - Bounded egress: byte and frame bounds hold at every observable
//!   instant, and sustained presence pressure leaves at most one queued
//!   frame per user.

use std::collections::BTreeMap;

use ciborium::value::Value;
use proptest::prelude::*;
use syncpod_core::{
    crdt::{CrdtDoc, DeltaSetKernel},
    egress::{EgressClass, EgressConfig, EgressQueue},
    presence::PresenceTable,
};
use syncpod_proto::{Frame, FrameKind};

fn arbitrary_updates() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(
        prop::collection::vec(any::<u8>(), 1..32)
            .prop_map(|seg| DeltaSetKernel::encode_update(&[&seg])),
        1..12,
    )
}

proptest! {
    #[test]
    fn crdt_converges_under_any_order(
        updates in arbitrary_updates(),
        seed in any::<u64>(),
        duplicate in any::<bool>(),
    ) {
        let mut in_order = CrdtDoc::<DeltaSetKernel>::new();
        for update in &updates {
            in_order.apply(update).unwrap();
        }

        // Shuffle deterministically from the seed, optionally delivering
        // every update twice (at-least-once delivery).
        let mut shuffled: Vec<&Vec<u8>> = updates.iter().collect();
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let mut reordered = CrdtDoc::<DeltaSetKernel>::new();
        for update in &shuffled {
            reordered.apply(update).unwrap();
            if duplicate {
                reordered.apply(update).unwrap();
            }
        }

        prop_assert_eq!(in_order.snapshot(), reordered.snapshot());
    }

    #[test]
    fn crdt_snapshot_replays_to_identical_state(updates in arbitrary_updates()) {
        let mut live = CrdtDoc::<DeltaSetKernel>::new();
        for update in &updates {
            live.apply(update).unwrap();
        }

        let mut cold = CrdtDoc::<DeltaSetKernel>::new();
        cold.apply(&live.snapshot()).unwrap();

        prop_assert_eq!(cold.snapshot(), live.snapshot());
    }

    #[test]
    fn presence_last_active_is_monotonic(
        events in prop::collection::vec(
            (any::<bool>(), 0u64..10_000, prop::sample::select(vec!["u1", "u2", "u3"])),
            1..64,
        ),
    ) {
        let mut table = PresenceTable::new();
        let mut observed: BTreeMap<String, u64> = BTreeMap::new();

        for (from_peer, ts, user) in events {
            let mut fields = BTreeMap::new();
            fields.insert("t".to_string(), Value::Integer((ts as i64).into()));

            if from_peer {
                table.apply_peer(user, Some(&fields), ts);
            } else {
                table.apply_diff(user, &fields, ts).unwrap();
            }

            if let Some(entry) = table.get(user) {
                let floor = observed.entry(user.to_string()).or_insert(0);
                prop_assert!(
                    entry.last_active >= *floor,
                    "last_active went backwards for {}: {} < {}",
                    user, entry.last_active, floor
                );
                *floor = entry.last_active;
            }
        }
    }

    #[test]
    fn egress_bounds_hold_at_every_instant(
        pushes in prop::collection::vec(
            (any::<bool>(), 0usize..600, prop::sample::select(vec!["a", "b", "c"])),
            1..200,
        ),
    ) {
        let config = EgressConfig { max_bytes: 2_048, max_frames: 16, slow_client_timeout_ms: 100 };
        let mut queue = EgressQueue::new(config.clone());

        for (i, (reliable, len, user)) in pushes.into_iter().enumerate() {
            let (frame, class) = if reliable {
                (Frame::new(FrameKind::StorageUpdate, vec![0u8; len]), EgressClass::Reliable)
            } else {
                (
                    Frame::new(FrameKind::PresenceDiff, vec![0u8; len]),
                    EgressClass::Presence { user_id: user.to_string() },
                )
            };
            queue.push(frame, class, i as u64);

            prop_assert!(queue.buffered_bytes() <= config.max_bytes);
            prop_assert!(queue.len() <= config.max_frames);
        }
    }

    #[test]
    fn presence_pressure_coalesces_to_one_frame_per_user(
        count in 10usize..500,
        user in prop::sample::select(vec!["u1", "u2"]),
    ) {
        let config = EgressConfig { max_bytes: 512, max_frames: 8, slow_client_timeout_ms: 100 };
        let mut queue = EgressQueue::new(config);

        for i in 0..count {
            queue.push(
                Frame::new(FrameKind::PresenceDiff, vec![0u8; 16]),
                EgressClass::Presence { user_id: user.to_string() },
                i as u64,
            );
        }

        prop_assert_eq!(queue.presence_frames_for(user), 1);
    }
}
