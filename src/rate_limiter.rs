use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// Rate limits operations by issuing timestamps indicating when the next
// operation should happen. Uses atomics, can be shared between threads.
//
// This is a token bucket expressed as a schedule: `next_nanos` is the time
// (relative to `base`) at which the bucket would be empty again. Tokens
// refill at `ops_per_second`, and up to `burst` of them can accumulate while
// nobody asks for one. The bucket starts with a single token.
pub struct RateLimiter {
    base: Instant,
    increment_nanos: u64,
    burst_window_nanos: u64,
    next_nanos: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter which allows one second's worth of operations
    /// to be saved up.
    pub fn new(base: Instant, ops_per_second: f64) -> Self {
        let burst = ops_per_second.max(1.0) as u64;
        Self::with_burst(base, ops_per_second, burst)
    }

    pub fn with_burst(base: Instant, ops_per_second: f64, burst: u64) -> Self {
        let increment_nanos = (1_000_000_000f64 / ops_per_second) as u64;
        Self {
            base,
            increment_nanos,
            burst_window_nanos: increment_nanos.saturating_mul(burst.saturating_sub(1)),
            next_nanos: AtomicU64::new(0),
        }
    }

    /// Reserves a slot for one operation and returns the moment it is
    /// allowed to start. Callers are served in the order in which they call
    /// this method.
    pub fn issue_next_start_time_at(&self, now: Instant) -> Instant {
        let now_nanos = now.saturating_duration_since(self.base).as_nanos() as u64;
        // Tokens saved up beyond the burst are lost
        let earliest = now_nanos.saturating_sub(self.burst_window_nanos);

        let mut current = self.next_nanos.load(Ordering::Relaxed);
        loop {
            let start = current.max(earliest);
            match self.next_nanos.compare_exchange_weak(
                current,
                start + self.increment_nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.base + Duration::from_nanos(start),
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits until the next operation may start. Returns the scheduled start
    /// time, or `None` if `stop` fired first.
    pub async fn acquire(&self, stop: &CancellationToken) -> Option<Instant> {
        let now = Instant::now();
        let start_time = self.issue_next_start_time_at(now).max(now);
        tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            _ = tokio::time::sleep_until(start_time) => Some(start_time),
        }
    }
}
