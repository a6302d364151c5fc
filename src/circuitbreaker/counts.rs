//! Rolling statistics and epoch tracking for a circuit breaker.

use chrono::{DateTime, Utc};

/// Request outcomes recorded during one breaker generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Requests admitted in this generation
    pub requests: u64,
    /// Successful outcomes
    pub total_successes: u64,
    /// Failed outcomes
    pub total_failures: u64,
    /// Successes since the last failure
    pub consecutive_successes: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
}

impl Counts {
    pub(crate) fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    pub(crate) fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    pub(crate) fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub(crate) fn clear(&mut self) {
        *self = Counts::default();
    }
}

/// The epoch during which a set of [`Counts`] is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    /// Strictly increasing per breaker
    pub id: u64,
    /// When this generation ends; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl Generation {
    pub(crate) fn first(expires_at: Option<DateTime<Utc>>) -> Self {
        Self { id: 0, expires_at }
    }

    /// The generation that follows this one.
    pub(crate) fn next(&self, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: self.id.wrapping_add(1),
            expires_at,
        }
    }

    /// Whether this generation has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}
