//! Exponential backoff and token-bucket rate limiting.
//!
//! Backoff delays are computed per attempt with uniform jitter so that
//! retrying tasks do not stampede. The rate limiter suspends callers until a
//! token is available; non-blocking acquisition is opt-in.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::{AgentError, Result};

/// Fraction of the computed delay used as +/- jitter.
const JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff policy: `min(base * 2^attempt, cap)` with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Policy used for HTTP retries: 1s doubling up to 30s. Five attempts
    /// sum to well under the two-minute worst-case budget.
    pub const fn http() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Policy used for pubsub reconnects: 1s doubling up to 60s.
    pub const fn websocket() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.cap)
    }

    /// Delay before retry number `attempt` (0-based), with +/-20% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt).as_secs_f64();
        let factor = rand::rng().random_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
        Duration::from_secs_f64(raw * factor)
    }

    /// Suspend for the delay of `attempt`.
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

/// A token bucket: `capacity` tokens refilled at `rate` tokens per second.
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Bucket for GraphQL calls: 20 req/s sustained, burst of 40.
    pub fn gql() -> Self {
        Self::new(40, 20.0)
    }

    /// Bucket for general HTTP calls: 10 req/s sustained, burst of 20.
    pub fn http() -> Self {
        Self::new(20, 10.0)
    }

    /// Take one token, refilling from elapsed time first. Returns how long
    /// the caller must wait if the bucket is empty.
    fn take(&self) -> Option<Duration> {
        let mut state = self.state.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        }
    }

    /// Acquire a token, suspending until one is available.
    pub async fn acquire(&self) {
        loop {
            match self.take() {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Acquire a token without blocking.
    pub fn try_acquire(&self) -> Result<()> {
        match self.take() {
            None => Ok(()),
            Some(_) => Err(AgentError::RateLimitExceeded),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
