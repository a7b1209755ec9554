//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness) so
//! the same state machines run under a virtual clock with seeded RNG in
//! tests and real system resources in production. Protocol code takes
//! timestamps as plain `now_ms` parameters; only driver code touches the
//! environment directly.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// Implementations MUST guarantee:
///
/// - `now_ms()` never decreases within one execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic milliseconds since an arbitrary epoch (pod start).
    ///
    /// Used for keepalives, rate limiting, TTLs, and presence stamping.
    /// Never goes backwards.
    fn now_ms(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch.
    ///
    /// Used only where a cross-restart timestamp is required (op record
    /// `ts`, token expiry checks).
    fn wall_clock_ms(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used exclusively by driver
    /// code, never by protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, for session ids and backoff jitter.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
