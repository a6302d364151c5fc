//! The contract shared by every rate limiter backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::{elapsed_between, SharedClock};
use crate::error::{BreakwaterError, Result};

/// A committed grant of quota and how long to hold off before using it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Whether the quota was granted
    pub ok: bool,
    /// The limiter's capacity (burst or window capacity)
    pub limit: i64,
    /// Units reserved
    pub tokens: i64,
    /// When the caller may act on the reservation
    pub time_to_act: DateTime<Utc>,
    /// When the reservation was requested
    pub delay_from: DateTime<Utc>,
}

impl Reservation {
    /// A reservation usable immediately.
    pub fn immediate(limit: i64, tokens: i64, now: DateTime<Utc>) -> Self {
        Self {
            ok: true,
            limit,
            tokens,
            time_to_act: now,
            delay_from: now,
        }
    }

    /// How long after the request instant the caller must wait.
    pub fn delay(&self) -> Duration {
        elapsed_between(self.delay_from, self.time_to_act)
    }

    /// How long the caller must still wait at `now`.
    pub fn delay_at(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(now, self.time_to_act)
    }

    /// Void the reservation.
    ///
    /// In-process limiters have already committed the units, so they are not
    /// handed back; later callers still pay for them.
    pub fn cancel(&mut self) {
        self.ok = false;
    }
}

/// Cancellation and deadline signal for [`RateLimiter::wait`].
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// No deadline, cancelled only through [`cancel`](Self::cancel).
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Share an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// This context with its deadline moved to `timeout` from now.
    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if there is none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for `delay` unless cancelled first.
    ///
    /// Fails fast with [`BreakwaterError::DeadlineExceeded`] when the delay
    /// cannot fit before the deadline.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if self.is_cancelled() {
            return Err(BreakwaterError::Cancelled);
        }
        if delay.is_zero() {
            return Ok(());
        }
        if let Some(deadline) = self.deadline {
            let fits = Instant::now()
                .checked_add(delay)
                .is_some_and(|wake| wake <= deadline);
            if !fits {
                return Err(BreakwaterError::DeadlineExceeded);
            }
        }

        tokio::select! {
            _ = self.token.cancelled() => Err(BreakwaterError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// A keyed rate limiter.
///
/// Costs of zero or less are always allowed and never touch limiter state.
/// The `*_n` variants take the current instant explicitly; the others read
/// the limiter's clock.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// The clock behind the convenience entry points.
    fn clock(&self) -> &SharedClock;

    /// Take `n` units if they are available at `now`.
    async fn allow_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Commit `n` units at `now` and report when they may be used.
    async fn reserve_n(&self, key: &str, n: i64, now: DateTime<Utc>) -> Result<Reservation>;

    async fn allow(&self, key: &str, n: i64) -> Result<bool> {
        let now = self.clock().now();
        self.allow_n(key, n, now).await
    }

    async fn reserve(&self, key: &str, n: i64) -> Result<Reservation> {
        let now = self.clock().now();
        self.reserve_n(key, n, now).await
    }

    async fn wait(&self, ctx: &WaitContext, key: &str, n: i64) -> Result<()> {
        let now = self.clock().now();
        self.wait_n(ctx, key, n, now).await
    }

    /// Reserve `n` units at `now`, then sleep until the reservation is due.
    ///
    /// The reservation is committed before the delay is known. Units stay
    /// committed when the wait is cancelled, and also when the delay turns
    /// out not to fit before the deadline: the call then fails at once with
    /// [`BreakwaterError::DeadlineExceeded`] but the key still carries the debt.
    async fn wait_n(&self, ctx: &WaitContext, key: &str, n: i64, now: DateTime<Utc>) -> Result<()> {
        if n <= 0 {
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(BreakwaterError::Cancelled);
        }

        let mut reservation = self.reserve_n(key, n, now).await?;
        if !reservation.ok {
            debug!(limiter = self.name(), key = %key, n, "Reservation can never be satisfied");
            return Err(BreakwaterError::LimitExceeded);
        }

        let delay = reservation.delay();
        trace!(limiter = self.name(), key = %key, n, delay = ?delay, "Waiting for reservation");

        if let Err(e) = ctx.sleep(delay).await {
            reservation.cancel();
            debug!(limiter = self.name(), key = %key, n, error = %e, "Wait abandoned");
            return Err(e);
        }
        Ok(())
    }
}
