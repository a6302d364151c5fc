//! Configuration management for breakwater.
//!
//! Breakers and limiters are declared by name in a YAML file:
//!
//! ```yaml
//! breakers:
//!   payments:
//!     max_requests: 3
//!     timeout_ms: 30000
//! limiters:
//!   api:
//!     algorithm: token_bucket
//!     rate: 10
//!     burst: 20
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::circuitbreaker::{
    ConsecutiveFailures, Settings, DEFAULT_FAILURE_THRESHOLD, DEFAULT_INTERVAL,
    DEFAULT_MAX_REQUESTS, DEFAULT_TIMEOUT,
};
use crate::clock::SharedClock;
use crate::error::{BreakwaterError, Result};
use crate::ratelimit::{
    DistributedTokenBucket, MemoryStore, RateLimiter, RedisStore, ScriptStore, SlidingWindow,
    TokenBucket, DEFAULT_PRECISION, DEFAULT_TTL, DEFAULT_WINDOW,
};

/// Main configuration for breakwater.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakwaterConfig {
    /// Circuit breakers by name
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,

    /// Rate limiters by name
    #[serde(default)]
    pub limiters: HashMap<String, LimiterConfig>,
}

impl BreakwaterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BreakwaterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| {
                BreakwaterError::Config(format!("Failed to parse configuration: {}", e))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limiter definition.
    pub fn validate(&self) -> Result<()> {
        for (name, limiter) in &self.limiters {
            limiter.validate().map_err(|e| match e {
                BreakwaterError::Config(msg) => {
                    BreakwaterError::Config(format!("limiter {:?}: {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Breaker settings for `name`, if declared.
    pub fn breaker(&self, name: &str) -> Option<Settings> {
        self.breakers.get(name).map(|b| b.settings(name))
    }

    /// Limiter definition for `name`, if declared.
    pub fn limiter(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.get(name)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Probe calls admitted while half-open
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Closed-state statistics period in milliseconds; 0 never resets
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Open-state duration in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Trip once consecutive failures exceed this
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl BreakerConfig {
    /// Breaker settings carrying this configuration.
    pub fn settings(&self, name: &str) -> Settings {
        Settings::new(name)
            .with_max_requests(self.max_requests)
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_trip_policy(ConsecutiveFailures(self.failure_threshold))
    }
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_failure_threshold() -> u64 {
    DEFAULT_FAILURE_THRESHOLD
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    Distributed,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub algorithm: Algorithm,

    /// Tokens (or requests) per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity for the token bucket algorithms
    #[serde(default = "default_burst")]
    pub burst: i64,

    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Sliding window sub-bucket width in milliseconds
    #[serde(default = "default_precision_ms")]
    pub precision_ms: u64,

    /// Idle key retention in the shared store, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Shared store key prefix
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Redis server; without it a distributed limiter uses an in-process store
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl LimiterConfig {
    /// A limiter definition with defaults for everything but the algorithm.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            rate: default_rate(),
            burst: default_burst(),
            window_ms: default_window_ms(),
            precision_ms: default_precision_ms(),
            ttl_secs: default_ttl_secs(),
            key_prefix: None,
            redis_url: None,
        }
    }

    /// Reject definitions that could never admit a request.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(BreakwaterError::Config(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }

        match self.algorithm {
            Algorithm::TokenBucket | Algorithm::Distributed => {
                if self.burst <= 0 {
                    return Err(BreakwaterError::Config(format!(
                        "burst must be positive, got {}",
                        self.burst
                    )));
                }
            }
            Algorithm::SlidingWindow => {
                if self.window_ms == 0 {
                    return Err(BreakwaterError::Config(
                        "window_ms must be positive".to_string(),
                    ));
                }
                if self.precision_ms == 0 {
                    return Err(BreakwaterError::Config(
                        "precision_ms must be positive".to_string(),
                    ));
                }
                let capacity = (self.rate * self.window_ms as f64 / 1000.0).floor();
                if capacity < 1.0 {
                    return Err(BreakwaterError::Config(format!(
                        "rate {} over {}ms admits no requests",
                        self.rate, self.window_ms
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the limiter. Connects to Redis when a distributed limiter names
    /// a server.
    pub async fn build(&self, clock: SharedClock) -> Result<Arc<dyn RateLimiter>> {
        self.validate()?;

        let limiter: Arc<dyn RateLimiter> = match self.algorithm {
            Algorithm::TokenBucket => {
                Arc::new(TokenBucket::new(self.rate, self.burst).with_clock(clock))
            }
            Algorithm::SlidingWindow => Arc::new(
                SlidingWindow::new(
                    self.rate,
                    Duration::from_millis(self.window_ms),
                    Duration::from_millis(self.precision_ms),
                )
                .with_clock(clock),
            ),
            Algorithm::Distributed => {
                let store: Arc<dyn ScriptStore> = match &self.redis_url {
                    Some(url) => Arc::new(RedisStore::connect(url).await?),
                    None => {
                        info!("No redis_url configured, sharing quota in process only");
                        Arc::new(MemoryStore::new())
                    }
                };
                let mut limiter = DistributedTokenBucket::new(store, self.rate, self.burst)
                    .with_ttl(Duration::from_secs(self.ttl_secs))
                    .with_clock(clock);
                if let Some(prefix) = &self.key_prefix {
                    limiter = limiter.with_prefix(prefix.clone());
                }
                Arc::new(limiter)
            }
        };

        info!(
            algorithm = limiter.name(),
            rate = self.rate,
            burst = self.burst,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }
}

fn default_rate() -> f64 {
    1.0
}

fn default_burst() -> i64 {
    1
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW.as_millis() as u64
}

fn default_precision_ms() -> u64 {
    DEFAULT_PRECISION.as_millis() as u64
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}
