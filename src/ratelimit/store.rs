//! Shared stores for the distributed token bucket.
//!
//! The refill-and-consume step must be indivisible for every client sharing
//! a key. [`RedisStore`] gets that from a server-side Lua script;
//! [`MemoryStore`] runs the same algorithm under a lock for single-node use.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::clock::secs_f64;
use crate::error::{BreakwaterError, Result};

/// Refill, then consume. Arguments after the key:
/// `now` (ms since the Unix epoch), `requested`, `rate` (per second),
/// `burst`, `ttl` (seconds), `mode`.
///
/// Replies `{allowed, wait, tokens_before}`; the numbers travel as strings
/// because Redis truncates Lua numbers to integers.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local requested = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local mode = ARGV[6]

local bucket = redis.call('HMGET', key, 'last', 'tokens')
local last = tonumber(bucket[1]) or now
local tokens = tonumber(bucket[2]) or burst

local elapsed = math.max(0, now - last)
tokens = math.min(burst, tokens + elapsed * rate / 1000)
last = math.max(last, now)
local before = tokens

if mode == 'reserve' then
    if requested > burst then
        return {0, '0', tostring(before)}
    end
elseif tokens < requested then
    return {0, tostring((requested - tokens) / rate), tostring(before)}
end

tokens = tokens - requested
local wait = 0
if tokens < 0 then
    wait = -tokens / rate
end

redis.call('HSET', key, 'last', tostring(last), 'tokens', tostring(tokens))
redis.call('EXPIRE', key, ttl)

return {1, tostring(wait), tostring(before)}
"#;

/// How the script treats a shortfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    /// Consume only when enough tokens are present
    Allow,
    /// Consume into debt; refuse only requests larger than the bucket
    Reserve,
}

impl BucketMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketMode::Allow => "allow",
            BucketMode::Reserve => "reserve",
        }
    }
}

impl fmt::Display for BucketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One refill-and-consume request against a stored bucket.
#[derive(Debug, Clone)]
pub struct BucketRequest {
    /// Caller-supplied instant; the store's own clock is never consulted
    pub now: DateTime<Utc>,
    pub requested: i64,
    pub rate: f64,
    pub burst: i64,
    /// Retention of an idle key, refreshed on every write
    pub ttl: Duration,
    pub mode: BucketMode,
}

impl BucketRequest {
    fn now_ms(&self) -> i64 {
        self.now.timestamp_millis()
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl_secs().saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Result of a refill-and-consume step.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketOutcome {
    /// Whether the tokens were taken
    pub allowed: bool,
    /// Delay until the request is covered
    pub wait: Duration,
    /// Token level after refill, before consumption
    pub tokens: f64,
}

/// A store that can run the token bucket step atomically.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn eval_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome>;
}

/// Redis-backed store.
pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
    script: redis::Script,
}

impl RedisStore {
    /// Connect to the Redis server at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(url = %redis_url, "Connected to Redis");
        Ok(Self::from_connection(connection))
    }

    /// Use an existing multiplexed connection.
    pub fn from_connection(connection: redis::aio::MultiplexedConnection) -> Self {
        Self {
            connection,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        let mut conn = self.connection.clone();

        let (allowed, wait, tokens): (i64, String, String) = self
            .script
            .key(key)
            .arg(request.now_ms())
            .arg(request.requested)
            .arg(request.rate)
            .arg(request.burst)
            .arg(request.ttl_secs())
            .arg(request.mode.as_str())
            .invoke_async(&mut conn)
            .await?;

        let outcome = BucketOutcome {
            allowed: allowed == 1,
            wait: secs_f64(parse_number(&wait, "wait")?),
            tokens: parse_number(&tokens, "tokens")?,
        };
        trace!(key = %key, mode = %request.mode, ?outcome, "Redis bucket script");
        Ok(outcome)
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn parse_number(raw: &str, field: &str) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|e| {
        BreakwaterError::Protocol(format!("invalid {} in script reply {:?}: {}", field, raw, e))
    })
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    /// Milliseconds since the Unix epoch
    last: i64,
    tokens: f64,
    /// Milliseconds since the Unix epoch
    expires_at: i64,
}

/// In-process store with the same semantics as the Redis script.
///
/// Keys expire `ttl` after their last write, measured on the caller's clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including ones that have expired but were not
    /// touched since.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Drop keys whose TTL has passed at `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let now = now.timestamp_millis();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| b.expires_at > now);
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, "Purged expired buckets");
        }
        purged
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        let now = request.now_ms();
        let requested = request.requested as f64;
        let rate = request.rate;
        let burst = request.burst as f64;

        let mut buckets = self.buckets.lock();
        let stored = buckets.get(key).filter(|b| b.expires_at > now).copied();

        let last = stored.map_or(now, |b| b.last);
        let elapsed = now.saturating_sub(last).max(0) as f64;
        let tokens = (stored.map_or(burst, |b| b.tokens) + elapsed * rate / 1000.0).min(burst);
        let before = tokens;

        let rejected = match request.mode {
            BucketMode::Reserve => (requested > burst).then_some(Duration::ZERO),
            BucketMode::Allow if tokens < requested => Some(secs_f64((requested - tokens) / rate)),
            BucketMode::Allow => None,
        };
        if let Some(wait) = rejected {
            return Ok(BucketOutcome {
                allowed: false,
                wait,
                tokens: before,
            });
        }

        let tokens = tokens - requested;
        buckets.insert(
            key.to_string(),
            StoredBucket {
                last: last.max(now),
                tokens,
                expires_at: now.saturating_add(request.ttl_ms()),
            },
        );

        Ok(BucketOutcome {
            allowed: true,
            wait: secs_f64(-tokens / rate),
            tokens: before,
        })
    }
}
