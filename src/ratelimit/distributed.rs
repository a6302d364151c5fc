//! Distributed token bucket backed by a shared store.
//!
//! Bucket state lives in the store, keyed by the limiter key, and is updated
//! by a single atomic script per decision. There is no client-side cache, so
//! every process sharing the store sees the same quota.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::limiter::{RateLimiter, Reservation};
use super::store::{BucketMode, BucketOutcome, BucketRequest, ScriptStore};
use crate::clock::{add, SharedClock, SystemClock};
use crate::error::Result;

/// Default retention of an idle key.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Default prefix for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "breakwater:ratelimit:";

/// A token bucket whose state is shared through a [`ScriptStore`].
pub struct DistributedTokenBucket {
    /// The shared store.
    store: Arc<dyn ScriptStore>,
    rate: f64,
    burst: i64,
    ttl: Duration,
    prefix: String,
    clock: SharedClock,
}

impl DistributedTokenBucket {
    /// Create a limiter refilling `rate` tokens per second up to `burst`.
    pub fn new(store: Arc<dyn ScriptStore>, rate: f64, burst: i64) -> Self {
        Self {
            store,
            rate,
            burst,
            ttl: DEFAULT_TTL,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Retention of idle keys. Rounded down to whole seconds, at least one.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
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

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The store key for a limiter key.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn eval(
        &self,
        key: &str,
        n: i64,
        now: DateTime<Utc>,
        mode: BucketMode,
    ) -> Result<BucketOutcome> {
        let store_key = self.store_key(key);
        let request = BucketRequest {
            now,
            requested: n,
            rate: self.rate,
            burst: self.burst,
            ttl: self.ttl,
            mode,
        };

        let outcome = self.store.eval_bucket(&store_key, &request).await?;

        trace!(
            key = %store_key,
            n,
            mode = %mode,
            allowed = outcome.allowed,
            tokens = outcome.tokens,
            wait = ?outcome.wait,
            "Distributed bucket decision"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl RateLimiter for DistributedTokenBucket {
    fn name(&self) -> &'static str {
        "distributed_token_bucket"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn allow_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<bool> {
        if n <= 0 {
            return Ok(true);
        }

        let outcome = self.eval(key, n, now, BucketMode::Allow).await?;
        if !outcome.allowed {
            debug!(
                key = %key,
                n,
                tokens = outcome.tokens,
                "Distributed rate limit exceeded"
            );
        }
        Ok(outcome.allowed)
    }

    /// Refuses (`ok == false`) only when `n` is larger than the bucket.
    async fn reserve_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<Reservation> {
        if n <= 0 {
            return Ok(Reservation::immediate(self.burst, 0, now));
        }

        let outcome = self.eval(key, n, now, BucketMode::Reserve).await?;
        if !outcome.allowed {
            debug!(key = %key, n, burst = self.burst, "Reservation larger than bucket");
        }

        Ok(Reservation {
            ok: outcome.allowed,
            limit: self.burst,
            tokens: n,
            time_to_act: add(now, outcome.wait),
            delay_from: now,
        })
    }
}
