//! Discretized token bucket used for per-provider rate limiting.
//!
//! Tokens are added lazily in whole refill intervals: a call made 2.5
//! intervals after the last refill adds two intervals' worth of tokens and
//! carries the remaining half interval forward.

use std::time::Duration;
use tokio::time::Instant;

use crate::provider::RateLimit;

/// Default refill granularity.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per millisecond.
    refill_rate: f64,
    refill_interval: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilling at `refill_rate`
    /// tokens per millisecond in steps of `refill_interval`.
    pub fn new(capacity: f64, refill_rate: f64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// A full bucket sized for `limit`: capacity is `limit.requests`, and the
    /// whole capacity is restored over one `limit.window`.
    pub fn for_rate_limit(limit: &RateLimit, refill_interval: Duration) -> Self {
        let capacity = f64::from(limit.requests);
        let window_ms = limit.window.as_millis().max(1) as f64;
        Self::new(capacity, capacity / window_ms, refill_interval)
    }

    /// Whole intervals elapsed since `last_refill`, and the tokens they add.
    fn pending_refill(&self) -> (u128, f64) {
        let interval_ms = self.refill_interval.as_millis();
        if interval_ms == 0 {
            return (0, 0.0);
        }
        let elapsed_ms = Instant::now().duration_since(self.last_refill).as_millis();
        let intervals = elapsed_ms / interval_ms;
        let added = intervals as f64 * (self.refill_rate * interval_ms as f64);
        (intervals, added)
    }

    fn refill(&mut self) {
        let (intervals, added) = self.pending_refill();
        if intervals == 0 {
            return;
        }

        let interval_ms = self.refill_interval.as_millis();
        self.tokens = (self.tokens + added).min(self.capacity);
        self.last_refill += Duration::from_millis((intervals * interval_ms) as u64);
    }

    /// Take `n` tokens if available. Leaves the bucket untouched otherwise.
    pub fn try_consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Current token count after refilling.
    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Token count without refilling, for read-only snapshots.
    pub fn peek_tokens(&self) -> f64 {
        let (_, added) = self.pending_refill();
        (self.tokens + added).min(self.capacity)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
