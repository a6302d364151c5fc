//! In-process sliding window counter.
//!
//! The trailing window is split into sub-buckets `precision` wide. Only
//! sub-buckets that still overlap the window are kept, so memory per key is
//! bounded by `window / precision` entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::limiter::{RateLimiter, Reservation};
use crate::clock::{add, secs_f64, SharedClock, SystemClock};
use crate::error::Result;

/// Default requests per second.
pub const DEFAULT_RATE: f64 = 1.0;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
/// Default sub-bucket width.
pub const DEFAULT_PRECISION: Duration = Duration::from_millis(100);

/// Requests counted in one sub-bucket of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Start of the sub-bucket, in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Requests recorded in the sub-bucket
    pub count: i64,
}

/// Sliding window limiter allowing `rate × window` requests per trailing window.
pub struct SlidingWindow {
    rate: f64,
    window: Duration,
    precision: Duration,
    windows: DashMap<String, Vec<WindowEntry>>,
    clock: SharedClock,
}

impl SlidingWindow {
    /// Create a limiter. Precision below one millisecond is raised to one.
    pub fn new(rate: f64, window: Duration, precision: Duration) -> Self {
        Self {
            rate,
            window,
            precision: precision.max(Duration::from_millis(1)),
            windows: DashMap::new(),
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

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn precision(&self) -> Duration {
        self.precision
    }

    /// Requests admitted per window.
    pub fn capacity(&self) -> i64 {
        (self.rate * self.window.as_secs_f64()).floor() as i64
    }

    /// Requests counted in the window ending at `now`, without pruning.
    pub fn count(&self, key: &str, now: DateTime<Utc>) -> i64 {
        let cutoff = now.timestamp_millis() - self.window_ms();
        self.windows
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.timestamp > cutoff)
                    .fold(0i64, |sum, e| sum.saturating_add(e.count))
            })
            .unwrap_or(0)
    }

    /// Live sub-buckets for `key`, oldest first.
    pub fn entries(&self, key: &str) -> Vec<WindowEntry> {
        let mut entries = self
            .windows
            .get(key)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    fn precision_ms(&self) -> i64 {
        i64::try_from(self.precision.as_millis()).unwrap_or(i64::MAX)
    }

    /// Start of the sub-bucket containing `now_ms`.
    fn bucket_start(&self, now_ms: i64) -> i64 {
        now_ms - now_ms.rem_euclid(self.precision_ms())
    }

    /// Run `f` on the pruned entries of `key` together with their total.
    fn with_entries<T>(
        &self,
        key: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Vec<WindowEntry>, i64) -> T,
    ) -> T {
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms.saturating_sub(self.window_ms());

        let mut entries = self.windows.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                rate = self.rate,
                window = ?self.window,
                precision = ?self.precision,
                "Creating sliding window"
            );
            Vec::new()
        });
        entries.retain(|e| e.timestamp > cutoff);
        let sum = entries
            .iter()
            .fold(0i64, |sum, e| sum.saturating_add(e.count));
        f(entries.value_mut(), sum)
    }

    fn record(&self, entries: &mut Vec<WindowEntry>, now: DateTime<Utc>, n: i64) {
        let timestamp = self.bucket_start(now.timestamp_millis());
        match entries.iter_mut().find(|e| e.timestamp == timestamp) {
            Some(entry) => entry.count = entry.count.saturating_add(n),
            None => entries.push(WindowEntry { timestamp, count: n }),
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_WINDOW, DEFAULT_PRECISION)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn allow_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<bool> {
        if n <= 0 {
            return Ok(true);
        }

        let capacity = self.capacity();
        let allowed = self.with_entries(key, now, |entries, sum| {
            let allowed = sum.saturating_add(n) <= capacity;
            if allowed {
                self.record(entries, now, n);
            }
            trace!(key = %key, n, sum, capacity, allowed, "Sliding window decision");
            allowed
        });

        if !allowed {
            debug!(key = %key, n, capacity, "Sliding window full");
        }
        Ok(allowed)
    }

    /// Always records the request, even past capacity, and reports how long
    /// the overflow takes to drain at `rate`.
    async fn reserve_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<Reservation> {
        let capacity = self.capacity();
        if n <= 0 {
            return Ok(Reservation::immediate(capacity, 0, now));
        }

        let wait = self.with_entries(key, now, |entries, sum| {
            let over = sum.saturating_add(n).saturating_sub(capacity);
            self.record(entries, now, n);
            if over > 0 {
                secs_f64(over as f64 / self.rate)
            } else {
                Duration::ZERO
            }
        });

        trace!(key = %key, n, capacity, wait = ?wait, "Sliding window reservation");

        Ok(Reservation {
            ok: true,
            limit: capacity,
            tokens: n,
            time_to_act: add(now, wait),
            delay_from: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BreakwaterError;
    use crate::ratelimit::WaitContext;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn at_ms(ms: i64) -> DateTime<Utc> {
        epoch() + chrono::Duration::milliseconds(ms)
    }

    fn ten_per_second() -> SlidingWindow {
        SlidingWindow::new(10.0, Duration::from_secs(1), Duration::from_millis(100))
    }

    #[test]
    fn test_capacity() {
        assert_eq!(ten_per_second().capacity(), 10);
        assert_eq!(
            SlidingWindow::new(2.5, Duration::from_secs(3), DEFAULT_PRECISION).capacity(),
            7
        );
    }

    #[test]
    fn test_precision_has_a_floor() {
        let limiter = SlidingWindow::new(1.0, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(limiter.precision(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_window_fills_and_recovers() {
        let limiter = ten_per_second();

        for i in 0..10 {
            assert!(
                limiter.allow_n("key", 1, at_ms(i * 5)).await.unwrap(),
                "Request {} should be allowed",
                i
            );
        }
        assert!(!limiter.allow_n("key", 1, at_ms(60)).await.unwrap());
        assert_eq!(limiter.entries("key").len(), 1);

        assert!(!limiter.allow_n("key", 1, at_ms(999)).await.unwrap());
        assert!(limiter.allow_n("key", 1, at_ms(1000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_old_sub_buckets_slide_out() {
        let limiter = ten_per_second();

        assert!(limiter.allow_n("key", 6, at_ms(0)).await.unwrap());
        assert!(limiter.allow_n("key", 4, at_ms(500)).await.unwrap());
        assert!(!limiter.allow_n("key", 1, at_ms(900)).await.unwrap());

        // The first sub-bucket leaves the window, the second stays.
        assert!(limiter.allow_n("key", 6, at_ms(1000)).await.unwrap());
        assert!(!limiter.allow_n("key", 1, at_ms(1000)).await.unwrap());
        assert_eq!(limiter.count("key", at_ms(1000)), 10);
        assert_eq!(
            limiter.entries("key"),
            vec![
                WindowEntry { timestamp: at_ms(500).timestamp_millis(), count: 4 },
                WindowEntry { timestamp: at_ms(1000).timestamp_millis(), count: 6 },
            ]
        );
    }

    #[tokio::test]
    async fn test_requests_share_a_sub_bucket() {
        let limiter = ten_per_second();

        assert!(limiter.allow_n("key", 2, at_ms(110)).await.unwrap());
        assert!(limiter.allow_n("key", 3, at_ms(190)).await.unwrap());

        assert_eq!(
            limiter.entries("key"),
            vec![WindowEntry { timestamp: at_ms(100).timestamp_millis(), count: 5 }]
        );
    }

    #[tokio::test]
    async fn test_rejection_does_not_record() {
        let limiter = ten_per_second();

        assert!(limiter.allow_n("key", 8, at_ms(0)).await.unwrap());
        assert!(!limiter.allow_n("key", 3, at_ms(0)).await.unwrap());
        assert_eq!(limiter.count("key", at_ms(0)), 8);
    }

    #[tokio::test]
    async fn test_non_positive_cost_is_free() {
        let limiter = ten_per_second();

        assert!(limiter.allow_n("key", 0, at_ms(0)).await.unwrap());
        let reservation = limiter.reserve_n("key", -1, at_ms(0)).await.unwrap();
        assert!(reservation.ok);
        assert_eq!(reservation.limit, 10);
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_commits_past_capacity() {
        let limiter = ten_per_second();

        let first = limiter.reserve_n("key", 10, at_ms(0)).await.unwrap();
        assert_eq!(first.delay(), Duration::ZERO);

        let second = limiter.reserve_n("key", 5, at_ms(0)).await.unwrap();
        assert!(second.ok);
        assert_eq!(second.tokens, 5);
        assert_eq!(second.delay(), Duration::from_millis(500));
        assert_eq!(limiter.count("key", at_ms(0)), 15);

        // Borrowed capacity blocks the rest of the window.
        assert!(!limiter.allow_n("key", 1, at_ms(500)).await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_reservations_saturate() {
        let limiter = ten_per_second();

        let first = limiter.reserve_n("key", i64::MAX, at_ms(0)).await.unwrap();
        let second = limiter.reserve_n("key", i64::MAX, at_ms(0)).await.unwrap();

        assert!(first.ok);
        assert!(second.ok);
        assert!(second.delay() >= first.delay());
        assert_eq!(limiter.count("key", at_ms(0)), i64::MAX);
        assert_eq!(
            limiter.entries("key"),
            vec![WindowEntry { timestamp: at_ms(0).timestamp_millis(), count: i64::MAX }]
        );
        assert!(!limiter.allow_n("key", 1, at_ms(500)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = ten_per_second();

        assert!(limiter.allow_n("a", 10, at_ms(0)).await.unwrap());
        assert!(limiter.allow_n("b", 10, at_ms(0)).await.unwrap());
        assert!(!limiter.allow_n("a", 1, at_ms(0)).await.unwrap());
        assert_eq!(limiter.len(), 2);

        limiter.clear();
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_wait_fails_fast_past_deadline() {
        let limiter = ten_per_second();
        let ctx = WaitContext::with_timeout(Duration::from_secs(1));
        let started = std::time::Instant::now();

        let result = limiter.wait(&ctx, "key", 1000).await;

        assert!(matches!(result, Err(BreakwaterError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
