//! Simulation environment: deterministic seeded RNG for test harnesses.
//!
//! Multi-pod scenarios need reproducible session ids and backoff jitter,
//! so `SimEnv` draws all randomness from a seeded `StdRng`: the same
//! seed replays the same sequence. Time stays anchored to the task
//! runtime (the coordinator and socket loops drive real tokio timers),
//! but the wall clock starts from a fixed base so token expiries in
//! tests are stable values rather than reads of the host clock.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, RngCore, SeedableRng};
use syncpod_core::Environment;

/// Deterministic [`Environment`] for tests and simulation.
///
/// Clones share the RNG, so draws interleave across tasks in poll order;
/// per-run determinism holds whenever the harness serializes its draws
/// (driver-level tests assign ids themselves and only jitter comes from
/// here).
#[derive(Clone)]
pub struct SimEnv {
    started: Instant,
    rng: Arc<Mutex<StdRng>>,
}

impl SimEnv {
    /// Fixed wall-clock origin; `wall_clock_ms` counts up from here.
    pub const WALL_BASE_MS: u64 = 1_700_000_000_000;

    /// Environment seeded for reproducible randomness.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { started: Instant::now(), rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))) }
    }
}

impl Environment for SimEnv {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_clock_ms(&self) -> u64 {
        Self::WALL_BASE_MS + self.now_ms()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("sim rng mutex poisoned").fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(env: &SimEnv, count: usize) -> Vec<u64> {
        (0..count).map(|_| env.random_u64()).collect()
    }

    #[test]
    fn same_seed_replays_the_same_sequence() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(draw(&a, 8), draw(&b, 8));
    }

    #[test]
    fn different_seeds_diverge() {
        let a = SimEnv::with_seed(1);
        let b = SimEnv::with_seed(2);
        assert_ne!(draw(&a, 8), draw(&b, 8));
    }

    #[test]
    fn clones_share_the_rng_stream() {
        let env = SimEnv::with_seed(7);
        let clone = env.clone();
        let replay = SimEnv::with_seed(7);

        // Alternating draws across clones consume one shared sequence.
        let interleaved = [env.random_u64(), clone.random_u64(), env.random_u64()];
        assert_eq!(interleaved.to_vec(), draw(&replay, 3));
    }

    #[test]
    fn wall_clock_is_anchored_at_the_base() {
        let env = SimEnv::with_seed(0);
        let wall = env.wall_clock_ms();
        assert!(wall >= SimEnv::WALL_BASE_MS);
        assert!(wall < SimEnv::WALL_BASE_MS + 60_000);
    }

    #[test]
    fn monotonic_ms_advances() {
        let env = SimEnv::with_seed(0);
        let t1 = env.now_ms();
        std::thread::sleep(Duration::from_millis(5));
        assert!(env.now_ms() >= t1 + 5);
    }
}
