//! Production environment: real time and OS entropy.

use std::time::{Duration, Instant};

use syncpod_core::Environment;

/// Production [`Environment`] backed by system clocks and `getrandom`.
///
/// `now_ms` is measured from pod start, so it is monotonic and immune to
/// wall-clock steps. `wall_clock_ms` is the real Unix time used for op
/// record timestamps and token expiry.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. A pod without working
/// entropy cannot mint session ids safely, and RNG failure indicates an
/// OS-level fault.
#[derive(Clone)]
pub struct SystemEnv {
    started: Instant,
}

impl SystemEnv {
    /// Environment anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Default for SystemEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SystemEnv {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_clock_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable for a network pod");
    }
}
