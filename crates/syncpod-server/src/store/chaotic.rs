//! Fault-injecting op store wrapper for chaos tests.
//!
//! Delegates to an inner store but fails operations with a configured
//! probability, driven by a seeded LCG so runs are reproducible. Used to
//! exercise the `TemporarilyReadOnly` path and the backoff policy.

use std::sync::{Arc, Mutex};

use super::{OpRecord, OpStore, OpStoreError};

/// Deterministic LCG for chaos injection.
struct ChaosRng {
    state: u64,
}

impl ChaosRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> f64 {
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

/// [`OpStore`] wrapper that randomly reports `Unavailable`.
#[derive(Clone)]
pub struct ChaoticOpStore<S: OpStore> {
    inner: S,
    failure_rate: f64,
    rng: Arc<Mutex<ChaosRng>>,
}

impl<S: OpStore> ChaoticOpStore<S> {
    /// Wrap `inner`, failing each operation with probability
    /// `failure_rate`.
    ///
    /// # Panics
    ///
    /// If `failure_rate` is outside `[0.0, 1.0]`.
    #[must_use]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be in [0.0, 1.0], got {failure_rate}"
        );

        Self { inner, failure_rate, rng: Arc::new(Mutex::new(ChaosRng::new(seed))) }
    }

    /// Underlying store, for checking invariants after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.rng.lock().expect("chaos rng mutex poisoned").next() < self.failure_rate
    }

    fn maybe_fail(&self, op: &str) -> Result<(), OpStoreError> {
        if self.should_fail() {
            Err(OpStoreError::Unavailable(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

impl<S: OpStore> OpStore for ChaoticOpStore<S> {
    fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
        ts: u64,
    ) -> Result<u64, OpStoreError> {
        self.maybe_fail("append")?;
        self.inner.append(room_id, site_id, bytes, ts)
    }

    fn range_scan(
        &self,
        room_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<OpRecord>, OpStoreError> {
        self.maybe_fail("range_scan")?;
        self.inner.range_scan(room_id, from_seq, limit)
    }

    fn latest_seq(&self, room_id: &str) -> Result<Option<u64>, OpStoreError> {
        self.maybe_fail("latest_seq")?;
        self.inner.latest_seq(room_id)
    }

    fn truncate_before(&self, room_id: &str, before_seq: u64) -> Result<u64, OpStoreError> {
        self.maybe_fail("truncate_before")?;
        self.inner.truncate_before(room_id, before_seq)
    }

    fn ping(&self) -> Result<(), OpStoreError> {
        self.maybe_fail("ping")?;
        self.inner.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemoryOpStore;
    use super::*;

    #[test]
    fn zero_rate_never_fails() {
        let store = ChaoticOpStore::with_seed(MemoryOpStore::new(), 0.0, 42);
        for i in 0..50u8 {
            store.append("R", "p", &[i], 0).unwrap();
        }
        assert_eq!(store.inner().latest_seq("R").unwrap(), Some(50));
    }

    #[test]
    fn full_rate_always_fails() {
        let store = ChaoticOpStore::with_seed(MemoryOpStore::new(), 1.0, 42);
        assert!(matches!(
            store.append("R", "p", b"x", 0),
            Err(OpStoreError::Unavailable(_))
        ));
        assert_eq!(store.inner().total_ops(), 0);
    }

    #[test]
    fn failures_are_reproducible() {
        let run = |seed: u64| -> Vec<bool> {
            let store = ChaoticOpStore::with_seed(MemoryOpStore::new(), 0.5, seed);
            (0..20u8).map(|i| store.append("R", "p", &[i], 0).is_ok()).collect()
        };

        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    #[test]
    fn successes_still_assign_dense_sequences() {
        let store = ChaoticOpStore::with_seed(MemoryOpStore::new(), 0.3, 99);

        let mut expected = 1;
        for i in 0..50u8 {
            if let Ok(seq) = store.append("R", "p", &[i], 0) {
                assert_eq!(seq, expected);
                expected += 1;
            }
        }
    }
}
