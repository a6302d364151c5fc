//! Error types for breakwater.

use thiserror::Error;

/// Rejection returned by a circuit breaker when it refuses a call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerError {
    /// The circuit is open and the call was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The circuit is half-open and already admitted its quota of probe calls.
    #[error("too many requests")]
    TooManyRequests,
}

/// Error returned by [`CircuitBreaker::execute`](crate::circuitbreaker::CircuitBreaker::execute).
///
/// Separates the breaker refusing the call from the wrapped operation failing.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The breaker rejected the call; the operation never ran.
    #[error(transparent)]
    Rejected(BreakerError),

    /// The operation ran and returned an error.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    /// Returns the inner operation error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Rejected(_) => None,
        }
    }
}

/// Main error type for breakwater operations.
#[derive(Error, Debug)]
pub enum BreakwaterError {
    /// A circuit breaker refused the call
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    /// The requested quota can never be granted by this limiter
    #[error("rate limit exceeded")]
    LimitExceeded,

    /// The wait was cancelled by the caller
    #[error("wait cancelled")]
    Cancelled,

    /// The wait could not complete before the caller's deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Shared store errors
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The shared store answered with something the limiter did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BreakwaterError {
    /// Whether this error is a policy rejection the caller may retry later.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BreakwaterError::Breaker(_) | BreakwaterError::LimitExceeded
        )
    }

    /// Whether the caller gave up waiting (cancellation or deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            BreakwaterError::Cancelled | BreakwaterError::DeadlineExceeded
        )
    }
}

/// Result type alias for breakwater operations.
pub type Result<T> = std::result::Result<T, BreakwaterError>;
