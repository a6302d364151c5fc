//! Circuit breaker: fail fast when a dependency keeps failing.

mod breaker;
mod counts;

pub use breaker::{
    CircuitBreaker, ConsecutiveFailures, Done, Settings, State, StateObserver, TripPolicy,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_INTERVAL, DEFAULT_MAX_REQUESTS, DEFAULT_TIMEOUT,
};
pub use counts::{Counts, Generation};
