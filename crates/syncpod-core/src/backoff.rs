//! Exponential backoff for dependency errors.
//!
//! Stream and op-store failures are retried with exponential backoff:
//! base 100 ms, factor 2, cap 5 s, jitter ±25%. While a dependency is in
//! backoff the pod keeps serving presence; storage writes are refused
//! with `TemporarilyReadOnly`.

use std::time::Duration;

/// Backoff schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First delay.
    pub base: Duration,
    /// Multiplier per attempt.
    pub factor: u32,
    /// Upper bound on the raw delay before jitter.
    pub cap: Duration,
    /// Jitter fraction: the final delay lands in `raw * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), factor: 2, cap: Duration::from_secs(5), jitter: 0.25 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jittered.
    ///
    /// `entropy` supplies the jitter randomness so simulation runs stay
    /// deterministic under a seeded environment.
    #[must_use]
    pub fn delay(&self, attempt: u32, entropy: u64) -> Duration {
        let exp = self.factor.saturating_pow(attempt.min(30));
        let raw = self.base.saturating_mul(exp).min(self.cap);

        // Map entropy into [-jitter, +jitter].
        let unit = (entropy % 10_000) as f64 / 10_000.0;
        let factor = 1.0 + self.jitter * (unit * 2.0 - 1.0);

        Duration::from_secs_f64((raw.as_secs_f64() * factor).max(0.0))
    }
}
