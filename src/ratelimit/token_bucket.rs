//! In-process token bucket limiter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::limiter::{RateLimiter, Reservation};
use crate::clock::{add, elapsed_between, secs_f64, SharedClock, SystemClock};
use crate::error::Result;

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE: f64 = 1.0;
/// Default bucket capacity.
pub const DEFAULT_BURST: i64 = 1;

/// Per-key token state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Current level; negative while paying off reservations
    tokens: f64,
    /// Instant of the last refill
    last: DateTime<Utc>,
}

impl Bucket {
    fn full(burst: f64, now: DateTime<Utc>) -> Self {
        Self { tokens: burst, last: now }
    }

    /// Add what accrued since the last refill, never beyond `burst`.
    fn refill(&mut self, rate: f64, burst: f64, now: DateTime<Utc>) {
        let elapsed = elapsed_between(self.last, now).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        if now > self.last {
            self.last = now;
        }
    }
}

/// A token bucket per key, refilled continuously at a fixed rate.
///
/// Buckets are created full on first use. Per-key refill and consumption
/// happen under the map's shard lock.
pub struct TokenBucket {
    rate: f64,
    burst: i64,
    buckets: DashMap<String, Bucket>,
    clock: SharedClock,
}

impl TokenBucket {
    /// Create a limiter refilling `rate` tokens per second up to `burst`.
    pub fn new(rate: f64, burst: i64) -> Self {
        Self {
            rate,
            burst,
            buckets: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> i64 {
        self.burst
    }

    /// Tokens `key` would have at `now`, without changing anything.
    ///
    /// Returns `None` if the key has never been used.
    pub fn tokens(&self, key: &str, now: DateTime<Utc>) -> Option<f64> {
        self.buckets.get(key).map(|bucket| {
            let mut bucket = *bucket;
            bucket.refill(self.rate, self.burst as f64, now);
            bucket.tokens
        })
    }

    /// Number of keys with a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Forget every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// The refilled bucket for `key`, created full if missing.
    fn bucket(&self, key: &str, now: DateTime<Utc>) -> RefMut<'_, String, Bucket> {
        let burst = self.burst as f64;
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                rate = self.rate,
                burst = self.burst,
                "Creating token bucket"
            );
            Bucket::full(burst, now)
        });
        bucket.refill(self.rate, burst, now);
        bucket
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn allow_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<bool> {
        if n <= 0 {
            return Ok(true);
        }

        let mut bucket = self.bucket(key, now);
        let allowed = bucket.tokens >= n as f64;
        if allowed {
            bucket.tokens -= n as f64;
        }

        trace!(key = %key, n, tokens = bucket.tokens, allowed, "Token bucket decision");
        if !allowed {
            debug!(key = %key, n, "Token bucket exhausted");
        }
        Ok(allowed)
    }

    async fn reserve_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<Reservation> {
        if n <= 0 {
            return Ok(Reservation::immediate(self.burst, 0, now));
        }

        let mut bucket = self.bucket(key, now);
        bucket.tokens -= n as f64;
        let wait = secs_f64(-bucket.tokens / self.rate);

        trace!(key = %key, n, tokens = bucket.tokens, wait = ?wait, "Token bucket reservation");

        Ok(Reservation {
            ok: true,
            limit: self.burst,
            tokens: n,
            time_to_act: add(now, wait),
            delay_from: now,
        })
    }
}
