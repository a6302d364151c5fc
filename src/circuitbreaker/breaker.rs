//! Three-state circuit breaker.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::counts::{Counts, Generation};
use crate::clock::{add, SharedClock, SystemClock};
use crate::error::{BreakerError, CallError};

/// Default number of probe requests admitted while half-open.
pub const DEFAULT_MAX_REQUESTS: u64 = 1;
/// Default length of a closed-state statistics period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Default time an open breaker waits before probing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default consecutive failure threshold for [`ConsecutiveFailures`].
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls pass through and outcomes are counted
    Closed,
    /// A limited number of probe calls are let through
    HalfOpen,
    /// Calls are rejected without being attempted
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Closed => "closed",
            State::HalfOpen => "half-open",
            State::Open => "open",
        };
        f.write_str(s)
    }
}

/// Decides from the current counts whether a closed breaker should open.
///
/// Evaluated after every failure recorded while closed.
pub trait TripPolicy: Send + Sync {
    fn should_trip(&self, counts: &Counts) -> bool;
}

impl<F> TripPolicy for F
where
    F: Fn(&Counts) -> bool + Send + Sync,
{
    fn should_trip(&self, counts: &Counts) -> bool {
        self(counts)
    }
}

/// Trips once consecutive failures exceed the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsecutiveFailures(pub u64);

impl Default for ConsecutiveFailures {
    fn default() -> Self {
        Self(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl TripPolicy for ConsecutiveFailures {
    fn should_trip(&self, counts: &Counts) -> bool {
        counts.consecutive_failures > self.0
    }
}

/// Receives every state transition of a breaker.
///
/// Called after the breaker's lock is released. A panic here is caught and
/// logged; it never reaches the caller of the breaker.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, name: &str, from: State, to: State);
}

impl<F> StateObserver for F
where
    F: Fn(&str, State, State) + Send + Sync,
{
    fn on_state_change(&self, name: &str, from: State, to: State) {
        self(name, from, to)
    }
}

/// Settings for a [`CircuitBreaker`].
#[derive(Clone)]
pub struct Settings {
    /// Name reported to observers and logs
    pub name: String,
    /// Probe calls admitted per half-open generation, and the number of
    /// consecutive successes that closes the breaker
    pub max_requests: u64,
    /// Closed-state statistics period; zero keeps counts until a transition
    pub interval: Duration,
    /// How long the breaker stays open before probing
    pub timeout: Duration,
    /// When to open
    pub trip_policy: Arc<dyn TripPolicy>,
    /// Optional transition callback
    pub observer: Option<Arc<dyn StateObserver>>,
    /// Time source for the convenience entry points
    pub clock: SharedClock,
}

impl Settings {
    /// Settings with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests: DEFAULT_MAX_REQUESTS,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            trip_policy: Arc::new(ConsecutiveFailures::default()),
            observer: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_trip_policy(mut self, policy: impl TripPolicy + 'static) -> Self {
        self.trip_policy = Arc::new(policy);
        self
    }

    pub fn with_observer(mut self, observer: impl StateObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

type Transition = (State, State);

struct Inner {
    state: State,
    generation: Generation,
    counts: Counts,
}

/// A circuit breaker guarding one dependency.
///
/// All bookkeeping sits behind a single mutex, so counting, trip evaluation
/// and the resulting transition are observed atomically by concurrent callers.
pub struct CircuitBreaker {
    name: String,
    max_requests: u64,
    interval: Duration,
    timeout: Duration,
    trip_policy: Arc<dyn TripPolicy>,
    observer: Option<Arc<dyn StateObserver>>,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

/// Outcome handle for a call admitted by [`CircuitBreaker::allow`].
///
/// Reports that arrive after the breaker moved to a new generation are
/// ignored. Dropping the handle without reporting records nothing.
#[must_use = "report the outcome with `success`, `failure` or `report`"]
pub struct Done<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
}

impl Done<'_> {
    pub fn success(self) {
        self.report(true)
    }

    pub fn failure(self) {
        self.report(false)
    }

    pub fn report(self, success: bool) {
        let now = self.breaker.clock.now();
        self.report_at(success, now)
    }

    pub fn report_at(self, success: bool, now: DateTime<Utc>) {
        self.breaker.record(Some(self.generation), success, now)
    }

    /// The generation the call was admitted in.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(settings: Settings) -> Self {
        let max_requests = settings.max_requests.max(1);
        let timeout = if settings.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            settings.timeout
        };
        let now = settings.clock.now();
        let expires_at = if settings.interval.is_zero() {
            None
        } else {
            Some(add(now, settings.interval))
        };

        debug!(
            name = %settings.name,
            max_requests,
            interval = ?settings.interval,
            timeout = ?timeout,
            "Creating circuit breaker"
        );

        Self {
            name: settings.name,
            max_requests,
            interval: settings.interval,
            timeout,
            trip_policy: settings.trip_policy,
            observer: settings.observer,
            clock: settings.clock,
            inner: Mutex::new(Inner {
                state: State::Closed,
                generation: Generation::first(expires_at),
                counts: Counts::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    ///
    /// Applies any time-based change that is due before answering: an open
    /// breaker past its timeout moves to half-open here, and the observer is
    /// notified, exactly as the next `allow` would have done.
    pub fn state(&self) -> State {
        self.state_at(self.clock.now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> State {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.current_state(&mut inner, now);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Snapshot of the current generation's counts.
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// The current generation.
    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    /// Ask to make a call. On success the returned handle must be used to
    /// report the outcome.
    pub fn allow(&self) -> Result<Done<'_>, BreakerError> {
        self.allow_at(self.clock.now())
    }

    pub fn allow_at(&self, now: DateTime<Utc>) -> Result<Done<'_>, BreakerError> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.current_state(&mut inner, now);

            let result = match inner.state {
                State::Open => Err(BreakerError::Open),
                State::HalfOpen if inner.counts.requests >= self.max_requests => {
                    Err(BreakerError::TooManyRequests)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation.id)
                }
            };
            (result, transition)
        };
        self.notify(transition);

        match result {
            Ok(generation) => {
                trace!(name = %self.name, generation, "Call admitted");
                Ok(Done {
                    breaker: self,
                    generation,
                })
            }
            Err(e) => {
                debug!(name = %self.name, reason = %e, "Call rejected");
                Err(e)
            }
        }
    }

    /// Record a success against the current generation.
    pub fn success(&self) {
        self.success_at(self.clock.now())
    }

    pub fn success_at(&self, now: DateTime<Utc>) {
        self.record(None, true, now)
    }

    /// Record a failure against the current generation.
    pub fn failure(&self) {
        self.failure_at(self.clock.now())
    }

    pub fn failure_at(&self, now: DateTime<Utc>) {
        self.record(None, false, now)
    }

    /// Run `op` under the breaker, counting an `Err` as a failure.
    pub fn execute<T, E, F>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let done = self.allow().map_err(CallError::Rejected)?;
        match op() {
            Ok(value) => {
                done.success();
                Ok(value)
            }
            Err(e) => {
                done.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Async counterpart of [`execute`](Self::execute).
    pub async fn execute_async<T, E, Fut>(&self, op: Fut) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let done = self.allow().map_err(CallError::Rejected)?;
        match op.await {
            Ok(value) => {
                done.success();
                Ok(value)
            }
            Err(e) => {
                done.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    fn record(&self, generation: Option<u64>, success: bool, now: DateTime<Utc>) {
        let transition = {
            let mut inner = self.inner.lock();
            let rolled = self.current_state(&mut inner, now);

            if generation.is_some_and(|g| g != inner.generation.id) {
                trace!(name = %self.name, ?generation, "Ignoring stale outcome");
                rolled
            } else if success {
                self.on_success(&mut inner, now).or(rolled)
            } else {
                self.on_failure(&mut inner, now).or(rolled)
            }
        };
        self.notify(transition);
    }

    fn on_success(&self, inner: &mut Inner, now: DateTime<Utc>) -> Option<Transition> {
        inner.counts.on_success();
        if inner.state == State::HalfOpen
            && inner.counts.consecutive_successes >= self.max_requests
        {
            return self.set_state(inner, State::Closed, now);
        }
        None
    }

    fn on_failure(&self, inner: &mut Inner, now: DateTime<Utc>) -> Option<Transition> {
        inner.counts.on_failure();
        match inner.state {
            State::Closed if self.trip_policy.should_trip(&inner.counts) => {
                self.set_state(inner, State::Open, now)
            }
            State::HalfOpen => self.set_state(inner, State::Open, now),
            _ => None,
        }
    }

    /// Apply expiry-driven changes: a closed or half-open generation rolls
    /// over, an open one gives way to half-open.
    fn current_state(&self, inner: &mut Inner, now: DateTime<Utc>) -> Option<Transition> {
        if !inner.generation.is_expired(now) {
            return None;
        }
        match inner.state {
            State::Closed | State::HalfOpen => {
                self.new_generation(inner, now);
                None
            }
            State::Open => self.set_state(inner, State::HalfOpen, now),
        }
    }

    fn set_state(&self, inner: &mut Inner, to: State, now: DateTime<Utc>) -> Option<Transition> {
        if inner.state == to {
            return None;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);
        Some((from, to))
    }

    fn new_generation(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.counts.clear();
        let expires_at = match inner.state {
            State::Open => Some(add(now, self.timeout)),
            State::Closed | State::HalfOpen if self.interval.is_zero() => None,
            State::Closed | State::HalfOpen => Some(add(now, self.interval)),
        };
        inner.generation = inner.generation.next(expires_at);
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        info!(name = %self.name, from = %from, to = %to, "Circuit breaker state changed");

        if let Some(observer) = &self.observer {
            let result = catch_unwind(AssertUnwindSafe(|| {
                observer.on_state_change(&self.name, from, to)
            }));
            if result.is_err() {
                warn!(name = %self.name, from = %from, to = %to, "State observer panicked");
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("counts", &inner.counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn test_clock() -> ManualClock {
        ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    fn breaker_with(clock: &ManualClock, settings: Settings) -> CircuitBreaker {
        CircuitBreaker::new(settings.with_clock(Arc::new(clock.clone())))
    }

    fn trip_after(n: u64) -> impl TripPolicy {
        move |counts: &Counts| counts.consecutive_failures >= n
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.allow().unwrap().failure();
    }

    fn succeed(breaker: &CircuitBreaker) {
        breaker.allow().unwrap().success();
    }

    #[test]
    fn test_breaker_starts_closed() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test"));

        assert_eq!(breaker.name(), "test");
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[test]
    fn test_counts_track_outcomes() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test"));

        succeed(&breaker);
        succeed(&breaker);
        fail(&breaker);

        let counts = breaker.counts();
        assert_eq!(counts.requests, 3);
        assert_eq!(counts.total_successes, 2);
        assert_eq!(counts.total_failures, 1);
        assert_eq!(counts.consecutive_failures, 1);
        assert_eq!(counts.consecutive_successes, 0);
    }

    #[test]
    fn test_default_policy_trips_after_threshold_exceeded() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test"));

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), State::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_open_rejects_until_timeout() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_timeout(Duration::from_secs(5))
                .with_trip_policy(trip_after(3)),
        );

        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.counts(), Counts::default());

        clock.advance(Duration::from_millis(4999));
        assert_eq!(breaker.allow().err(), Some(BreakerError::Open));

        clock.advance(Duration::from_millis(1));
        let done = breaker.allow().expect("first call after timeout is admitted");
        assert_eq!(breaker.state(), State::HalfOpen);
        done.success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_half_open_limits_probes_and_closes() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_max_requests(3)
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1)),
        );

        fail(&breaker);
        clock.advance(Duration::from_secs(1));

        let probes: Vec<_> = (0..3).map(|_| breaker.allow().unwrap()).collect();
        assert_eq!(breaker.state(), State::HalfOpen);
        assert_eq!(breaker.allow().err(), Some(BreakerError::TooManyRequests));

        let mut probes = probes.into_iter();
        probes.next().unwrap().success();
        probes.next().unwrap().success();
        assert_eq!(breaker.state(), State::HalfOpen);
        probes.next().unwrap().success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_max_requests(2)
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1)),
        );

        fail(&breaker);
        clock.advance(Duration::from_secs(1));

        let first = breaker.allow().unwrap();
        let second = breaker.allow().unwrap();
        first.success();
        assert_eq!(breaker.counts().consecutive_successes, 1);

        second.failure();
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.counts(), Counts::default());
        assert_eq!(breaker.allow().err(), Some(BreakerError::Open));
    }

    #[test]
    fn test_half_open_generation_expiry_refreshes_quota() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_max_requests(2)
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1)),
        );

        fail(&breaker);
        clock.advance(Duration::from_secs(1));

        let first = breaker.allow().unwrap();
        let _second = breaker.allow().unwrap();
        assert_eq!(breaker.allow().err(), Some(BreakerError::TooManyRequests));
        let half_open = breaker.generation();

        clock.advance(Duration::from_secs(10));
        let retry = breaker.allow().expect("expired half-open generation admits again");

        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.generation().id > half_open.id);
        assert_eq!(breaker.counts().requests, 1);
        assert_eq!(breaker.counts().total_successes, 0);

        // Calls admitted in the previous generation no longer count.
        first.success();
        assert_eq!(breaker.counts().total_successes, 0);
        retry.success();
        assert_eq!(breaker.counts().consecutive_successes, 1);
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[test]
    fn test_state_query_applies_due_transition() {
        let clock = test_clock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1))
                .with_observer(move |_: &str, from: State, to: State| {
                    sink.lock().push((from, to));
                }),
        );

        fail(&breaker);
        clock.advance(Duration::from_secs(1));

        assert_eq!(breaker.state(), State::HalfOpen);
        assert_eq!(
            *seen.lock(),
            vec![(State::Closed, State::Open), (State::Open, State::HalfOpen)]
        );

        // The admission that follows finds the breaker already half-open.
        breaker.allow().unwrap().success();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_stale_report_is_ignored() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1)),
        );

        let slow = breaker.allow().unwrap();
        fail(&breaker);
        assert_eq!(breaker.state(), State::Open);

        // Admitted in the closed generation, reported after the trip.
        slow.success();
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.counts().total_successes, 0);
    }

    #[test]
    fn test_interval_rolls_closed_counts() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_interval(Duration::from_secs(10))
                .with_trip_policy(trip_after(3)),
        );

        fail(&breaker);
        fail(&breaker);
        let before = breaker.generation();

        clock.advance(Duration::from_secs(10));
        fail(&breaker);

        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 1);
        assert!(breaker.generation().id > before.id);
    }

    #[test]
    fn test_zero_interval_never_rolls() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test").with_interval(Duration::ZERO));

        fail(&breaker);
        clock.advance(Duration::from_secs(3600));
        fail(&breaker);

        assert_eq!(breaker.generation().expires_at, None);
        assert_eq!(breaker.counts().total_failures, 2);
    }

    #[test]
    fn test_observer_sees_transitions() {
        let clock = test_clock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let breaker = breaker_with(
            &clock,
            Settings::new("payments")
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1))
                .with_observer(move |name: &str, from: State, to: State| {
                    sink.lock().push((name.to_string(), from, to));
                }),
        );

        fail(&breaker);
        clock.advance(Duration::from_secs(1));
        succeed(&breaker);

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("payments".to_string(), State::Closed, State::Open),
                ("payments".to_string(), State::Open, State::HalfOpen),
                ("payments".to_string(), State::HalfOpen, State::Closed),
            ]
        );
    }

    #[test]
    fn test_observer_may_query_breaker() {
        let clock = test_clock();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();

        let breaker = Arc::new_cyclic(|weak: &std::sync::Weak<CircuitBreaker>| {
            let weak = weak.clone();
            breaker_with(
                &clock,
                Settings::new("test")
                    .with_trip_policy(trip_after(1))
                    .with_observer(move |_: &str, _: State, _: State| {
                        if let Some(b) = weak.upgrade() {
                            *sink.lock() = Some(b.state());
                        }
                    }),
            )
        });

        fail(&breaker);
        assert_eq!(*observed.lock(), Some(State::Open));
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let clock = test_clock();
        let breaker = breaker_with(
            &clock,
            Settings::new("test")
                .with_trip_policy(trip_after(1))
                .with_observer(|_: &str, _: State, _: State| panic!("observer failure")),
        );

        fail(&breaker);
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_direct_reports_update_counts() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test").with_trip_policy(trip_after(2)));

        breaker.success();
        breaker.failure();
        assert_eq!(breaker.state(), State::Closed);
        breaker.failure();
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_execute_propagates_errors() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test").with_trip_policy(trip_after(1)));

        let ok: Result<u32, CallError<&str>> = breaker.execute(|| Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let err = breaker.execute(|| Err::<u32, _>("boom")).unwrap_err();
        assert!(matches!(err, CallError::Inner("boom")));

        let rejected = breaker.execute(|| Ok::<u32, &str>(1)).unwrap_err();
        assert!(matches!(rejected, CallError::Rejected(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_execute_async_counts_outcomes() {
        let clock = test_clock();
        let breaker = breaker_with(&clock, Settings::new("test"));

        let value = breaker
            .execute_async(async { Ok::<_, std::io::Error>("done") })
            .await
            .unwrap();
        assert_eq!(value, "done");

        let err = breaker
            .execute_async(async { Err::<(), _>(std::io::Error::other("down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Inner(_)));

        let counts = breaker.counts();
        assert_eq!(counts.total_successes, 1);
        assert_eq!(counts.total_failures, 1);
    }

    #[test]
    fn test_concurrent_probes_close_breaker() {
        let clock = test_clock();
        let breaker = Arc::new(breaker_with(
            &clock,
            Settings::new("test")
                .with_max_requests(4)
                .with_timeout(Duration::from_secs(1))
                .with_trip_policy(trip_after(1)),
        ));

        fail(&breaker);
        clock.advance(Duration::from_secs(1));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.allow().map(|done| done.success()).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 4);
        assert_eq!(breaker.state(), State::Closed);
    }
}
