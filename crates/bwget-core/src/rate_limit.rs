//! Token bucket rate limiter for bandwidth capping
//!
//! Bounds the cumulative rate at which chunks are written to disk. The
//! bucket holds at most one refill interval (one second) worth of tokens,
//! so no large burst credit accumulates while the transfer is idle and the
//! throttle stays responsive.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Bytes-per-second throttle shared by everything that writes transfer data.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug)]
struct RateLimiterState {
    /// Maximum tokens (bytes) the bucket can hold.
    capacity: u64,
    /// Currently available tokens.
    tokens: f64,
    /// Last refill time.
    last_refill: Instant,
    /// Tokens added per second (the configured cap).
    refill_rate: u64,
    /// True when no throttling applies.
    is_unlimited: bool,
}

impl RateLimiter {
    /// Create a limiter capped at `bytes_per_second` (0 = unlimited).
    pub fn new(bytes_per_second: u64) -> Self {
        if bytes_per_second == 0 {
            return Self::unlimited();
        }
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                capacity: bytes_per_second,
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
                refill_rate: bytes_per_second,
                is_unlimited: false,
            })),
        }
    }

    /// Create a limiter that never blocks.
    pub fn unlimited() -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                capacity: u64::MAX,
                tokens: f64::MAX,
                last_refill: Instant::now(),
                refill_rate: u64::MAX,
                is_unlimited: true,
            })),
        }
    }

    /// Block until `bytes` worth of tokens have been consumed.
    ///
    /// Consumption happens in slices no larger than the bucket capacity, so
    /// a request bigger than one refill interval's budget drains over
    /// multiple intervals instead of stalling forever. Waits are bounded
    /// (50 ms max) so the caller can observe cancellation between them.
    /// Data is never dropped, only delayed.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            remaining -= self.acquire_some(remaining).await;
        }
    }

    async fn acquire_some(&self, want: u64) -> u64 {
        const MAX_SLICE: u64 = 16 * 1024;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if state.is_unlimited {
                    return want;
                }

                refill(&mut state);

                let slice = want.min(MAX_SLICE).min(state.capacity.max(1));
                if state.tokens >= slice as f64 {
                    state.tokens -= slice as f64;
                    return slice;
                }

                let needed = slice as f64 - state.tokens;
                let wait_secs = needed / state.refill_rate as f64;
                Duration::from_secs_f64(wait_secs.min(0.05))
            };

            // Sleep outside the lock.
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Replace the cap (0 = unlimited). Takes effect on the next acquire.
    pub async fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock().await;
        if bytes_per_second == 0 {
            state.capacity = u64::MAX;
            state.refill_rate = u64::MAX;
            state.tokens = f64::MAX;
            state.is_unlimited = true;
        } else {
            state.capacity = bytes_per_second;
            state.refill_rate = bytes_per_second;
            state.is_unlimited = false;
            state.tokens = state.tokens.min(bytes_per_second as f64);
        }
    }
}

fn refill(state: &mut RateLimiterState) {
    if state.is_unlimited {
        return;
    }
    let now = Instant::now();
    let elapsed_secs = now.duration_since(state.last_refill).as_secs_f64();
    if elapsed_secs > 0.001 {
        let new_tokens = elapsed_secs * state.refill_rate as f64;
        state.tokens = (state.tokens + new_tokens).min(state.capacity as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_throttling() {
        let limiter = RateLimiter::new(1000); // 1 KB/s

        let start = Instant::now();
        limiter.acquire(500).await; // full bucket, immediate
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await; // drains the bucket, still immediate
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await; // must wait ~0.5s for refill
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn oversized_acquire_drains_across_intervals() {
        let limiter = RateLimiter::new(10_000);

        let start = Instant::now();
        limiter.acquire(15_000).await; // 10k burst + 5k refilled
        let elapsed = start.elapsed();
        assert!(elapsed.as_millis() >= 400, "elapsed {:?}", elapsed);
        assert!(elapsed.as_millis() < 2_000, "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn zero_cap_means_unlimited() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.acquire(u64::MAX / 2).await;
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn cap_change_applies_immediately() {
        let limiter = RateLimiter::new(100);
        limiter.set_limit(0).await;

        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed().as_millis() < 50);
    }
}
