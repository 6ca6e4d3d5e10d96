//! Circuit breaker
//!
//! Gates calls to an unreliable dependency based on its recent failures.
//!
//! ```text
//!            strategy says open                 reopen delay elapsed
//!   Closed ─────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!     ▲                                ▲                                 │
//!     │       probe failed (handled)   └─────────────────────────────────┤
//!     └──────────────────────────────────────────────────────────────────┘
//!                    probe succeeded (or failed unhandled)
//! ```
//!
//! While half-open exactly one probe call runs. It is spawned onto the tokio
//! runtime under its own cancellation token, so it settles the circuit even
//! when every caller waiting on it has gone away. Callers arriving meanwhile
//! attach to that probe and receive its result instead of calling the
//! dependency themselves. [`CircuitBreaker::isolate`] holds the circuit open
//! manually until every returned [`IsolationHandle`] is released.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffFactory, BackoffStep, ConstantBackoff};
use crate::breaker::{BreakerStrategy, CircuitState, StrategySnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::events::{ListenerHandle, Listeners, SuccessEvent};
use crate::outcome::{Classifier, Executor, FailureEvent, FailureReason, Outcome};

/// Default delay before an open circuit lets a probe through
pub const DEFAULT_HALF_OPEN_AFTER: Duration = Duration::from_secs(60);

/// Context handed to the reopen backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalfOpenBackoffContext {
    /// How many times in a row the circuit has opened, starting at 1
    pub attempt: u32,
}

/// Why the circuit broke
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakEvent<T, E> {
    /// The strategy opened the circuit after this failure
    Failure(FailureReason<T, E>),
    /// The circuit was isolated manually
    Isolated,
    /// The half-open probe panicked and the circuit reopened
    ProbePanicked,
}

type ReopenBackoff = Arc<dyn BackoffFactory<HalfOpenBackoffContext>>;
type ReopenStep = Box<dyn BackoffStep<HalfOpenBackoffContext>>;
// Resolves to `None` when the probe task ended without a result.
type Probe<T, E> = Shared<BoxFuture<'static, Option<Result<T, E>>>>;

enum State<T, E> {
    Closed,
    Open {
        opened_at: Instant,
        // `None` when the reopen backoff produced nothing: probe immediately.
        schedule: Option<ReopenStep>,
        attempt: u32,
    },
    HalfOpen {
        probe: Probe<T, E>,
        id: u64,
        schedule: Option<ReopenStep>,
        attempt: u32,
    },
    Isolated {
        refcount: usize,
    },
}

impl<T, E> State<T, E> {
    fn public(&self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
            Self::Isolated { .. } => CircuitState::Isolated,
        }
    }
}

struct Core<T, E> {
    state: State<T, E>,
    strategy: Box<dyn BreakerStrategy>,
    last_failure: Option<FailureReason<T, E>>,
}

/// A state change to announce once the lock is released
enum Transition<T, E> {
    Opened(FailureReason<T, E>),
    Reopened,
    HalfOpened,
    Closed,
    Isolated,
}

enum Admission<F, T, E> {
    Run(F),
    Await(Probe<T, E>),
}

struct Inner<T, E> {
    executor: Executor<T, E>,
    half_open_after: ReopenBackoff,
    clock: Arc<dyn Clock>,
    core: Mutex<Core<T, E>>,
    next_probe_id: AtomicU64,
    on_break: Listeners<BreakEvent<T, E>>,
    on_reset: Listeners<()>,
    on_half_open: Listeners<()>,
    on_state_change: Listeners<CircuitState>,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    fn notify(&self, transition: Transition<T, E>) {
        let state = match transition {
            Transition::Opened(reason) => {
                self.on_break.emit(&BreakEvent::Failure(reason));
                CircuitState::Open
            }
            Transition::Reopened => {
                self.on_break.emit(&BreakEvent::ProbePanicked);
                CircuitState::Open
            }
            Transition::Isolated => {
                self.on_break.emit(&BreakEvent::Isolated);
                CircuitState::Isolated
            }
            Transition::HalfOpened => {
                self.on_half_open.emit(&());
                CircuitState::HalfOpen
            }
            Transition::Closed => {
                self.on_reset.emit(&());
                CircuitState::Closed
            }
        };
        self.on_state_change.emit(&state);
    }

    /// Open the circuit from Closed with a fresh reopen schedule
    fn open(&self, core: &mut Core<T, E>) {
        let schedule = self.half_open_after.next(&HalfOpenBackoffContext { attempt: 1 });
        core.state = State::Open { opened_at: self.clock.now(), schedule, attempt: 1 };
    }

    /// Apply a probe's outcome, unless the circuit has moved on since
    fn settle_probe(&self, probe_id: u64, outcome: &Outcome<T, E>) {
        let transition = {
            let mut core = self.core.lock();
            let (schedule, attempt) = match &mut core.state {
                State::HalfOpen { id, schedule, attempt, .. } if *id == probe_id => {
                    (schedule.take(), *attempt)
                }
                _ => return,
            };

            match outcome {
                Outcome::Success(_) | Outcome::Unhandled(_) => {
                    core.strategy.success(CircuitState::HalfOpen);
                    core.state = State::Closed;
                    Transition::Closed
                }
                Outcome::Failure(reason) => {
                    core.strategy.failure(CircuitState::HalfOpen);
                    core.last_failure = Some(reason.clone());
                    core.state = State::Open { opened_at: self.clock.now(), schedule, attempt };
                    Transition::Opened(reason.clone())
                }
            }
        };

        match &transition {
            Transition::Closed => info!("Circuit breaker closed after successful probe"),
            _ => warn!("Circuit breaker reopened after failed probe"),
        }
        self.notify(transition);
    }

    /// Reopen after a probe that never produced an outcome
    fn abandon_probe(&self, probe_id: u64) {
        {
            let mut core = self.core.lock();
            let (schedule, attempt) = match &mut core.state {
                State::HalfOpen { id, schedule, attempt, .. } if *id == probe_id => {
                    (schedule.take(), *attempt)
                }
                _ => return,
            };
            core.strategy.failure(CircuitState::HalfOpen);
            core.state = State::Open { opened_at: self.clock.now(), schedule, attempt };
        }

        error!("Circuit breaker probe panicked, reopening");
        self.notify(Transition::Reopened);
    }

    fn release_isolation(&self) {
        {
            let mut core = self.core.lock();
            let State::Isolated { refcount } = &mut core.state else {
                return;
            };
            *refcount = refcount.saturating_sub(1);
            if *refcount > 0 {
                return;
            }
            core.state = State::Closed;
        }

        info!("Circuit breaker isolation released");
        self.notify(Transition::Closed);
    }
}

/// Circuit breaker over operations returning `Result<T, E>`
///
/// Cloning is cheap and clones share state, so keep one breaker per
/// dependency and hand clones to every caller.
///
/// `T` and `E` must be `Clone`: every caller attached to a half-open probe
/// receives its own copy of the probe's result.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use keelson_policy::{CircuitBreaker, CircuitState, ConsecutiveBreaker};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::<u32, std::fmt::Error>::builder(ConsecutiveBreaker::new(2)?)
///     .half_open_after(Duration::from_secs(10))
///     .build()?;
///
/// let value = breaker.execute(|_cancel| async { Ok(7) }).await?;
/// assert_eq!(value, 7);
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> CircuitBreaker<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    /// Start building a breaker around `strategy`
    pub fn builder(strategy: impl BreakerStrategy + 'static) -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder::new(Box::new(strategy))
    }

    /// Build a breaker from its serializable configuration
    pub fn from_config(
        config: &CircuitBreakerConfig,
        classifier: Classifier<T, E>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let builder = CircuitBreakerBuilder::new(config.strategy.build()?).classifier(classifier);
        let builder = match &config.half_open_backoff {
            Some(backoff) => builder.half_open_backoff(backoff.build::<HalfOpenBackoffContext>()?),
            None => builder.half_open_after(config.half_open_after),
        };
        builder.build()
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.core.lock().state.public()
    }

    /// Most recent handled failure, kept across state changes
    pub fn last_failure(&self) -> Option<FailureReason<T, E>> {
        self.inner.core.lock().last_failure.clone()
    }

    /// Export the strategy's counters
    pub fn strategy_snapshot(&self) -> StrategySnapshot {
        self.inner.core.lock().strategy.snapshot()
    }

    /// Called when the circuit opens or is isolated
    pub fn on_break<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&BreakEvent<T, E>) + Send + Sync + 'static,
    {
        self.inner.on_break.add(listener)
    }

    /// Called when the circuit closes
    pub fn on_reset<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_reset.add(move |()| listener())
    }

    /// Called when a probe is let through
    pub fn on_half_open<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_half_open.add(move |()| listener())
    }

    /// Called on every state change, after the more specific listener
    pub fn on_state_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.inner.on_state_change.add(move |state| listener(*state))
    }

    /// Called after every successful call, probes included
    pub fn on_success<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.inner.executor.on_success(listener)
    }

    /// Called after every failed call with its classification
    pub fn on_failure<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&FailureEvent<T, E>) + Send + Sync + 'static,
    {
        self.inner.executor.on_failure(listener)
    }

    /// Hold the circuit open until the returned handle is released
    ///
    /// Isolation is counted: the circuit closes again only once every
    /// handle from every `isolate` call has been released.
    pub fn isolate(&self) -> IsolationHandle {
        let entered = {
            let mut core = self.inner.core.lock();
            if let State::Isolated { refcount } = &mut core.state {
                *refcount += 1;
                false
            } else {
                core.state = State::Isolated { refcount: 1 };
                true
            }
        };

        if entered {
            warn!("Circuit breaker isolated");
            self.inner.notify(Transition::Isolated);
        }

        let inner = Arc::clone(&self.inner);
        IsolationHandle { release: Some(Box::new(move || inner.release_isolation())) }
    }

    /// Run `operation` through the breaker
    pub async fn execute<F, Fut>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new()).await
    }

    /// Run `operation` under a token derived from `parent`
    ///
    /// The operation receives the derived token, except a half-open probe,
    /// which runs under a token of its own. A caller waiting on a probe stops
    /// waiting with [`ResilienceError::TaskCancelled`] as soon as its token
    /// is cancelled; the probe itself carries on. A caller that is already
    /// cancelled is refused without touching the circuit.
    ///
    /// Must be called within a tokio runtime.
    #[instrument(skip_all)]
    pub async fn execute_with_cancellation<F, Fut>(
        &self,
        operation: F,
        parent: &CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = parent.child_token();
        if token.is_cancelled() {
            return Err(ResilienceError::TaskCancelled);
        }
        match self.admit(operation)? {
            Admission::Await(probe) => Self::await_probe(probe, &token).await,
            Admission::Run(operation) => self.run_closed(operation, token).await,
        }
    }

    fn admit<F, Fut>(&self, operation: F) -> ResilienceResult<Admission<F, T, E>, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (admission, launch) = {
            let mut core = self.inner.core.lock();
            match std::mem::replace(&mut core.state, State::Closed) {
                State::Closed => (Admission::Run(operation), None),
                State::Isolated { refcount } => {
                    core.state = State::Isolated { refcount };
                    debug!("Circuit breaker rejecting call - state: {}", CircuitState::Isolated);
                    return Err(ResilienceError::IsolatedCircuit);
                }
                State::HalfOpen { probe, id, schedule, attempt } => {
                    let waiting = probe.clone();
                    core.state = State::HalfOpen { probe, id, schedule, attempt };
                    (Admission::Await(waiting), None)
                }
                State::Open { opened_at, schedule, attempt } => {
                    let delay = schedule.as_ref().map_or(Duration::ZERO, |step| step.duration());
                    if self.inner.clock.now().saturating_duration_since(opened_at) < delay {
                        core.state = State::Open { opened_at, schedule, attempt };
                        debug!("Circuit breaker rejecting call - state: {}", CircuitState::Open);
                        return Err(ResilienceError::BrokenCircuit);
                    }

                    let attempt = attempt.saturating_add(1);
                    let context = HalfOpenBackoffContext { attempt };
                    let advanced = schedule.as_ref().and_then(|step| step.next(&context));
                    let schedule = advanced.or(schedule);

                    let id = self.inner.next_probe_id.fetch_add(1, Ordering::Relaxed);
                    let (probe, task) = self.probe(operation, id);
                    core.state =
                        State::HalfOpen { probe: probe.clone(), id, schedule, attempt };
                    (Admission::Await(probe), Some(task))
                }
            }
        };

        if let Some(task) = launch {
            info!("Circuit breaker half-open, probing");
            self.inner.notify(Transition::HalfOpened);
            tokio::spawn(task);
        }
        Ok(admission)
    }

    /// Build the probe task and the shared handle callers wait on
    ///
    /// The task settles the circuit before publishing its result, so a
    /// caller that sees the result also sees the settled state.
    fn probe<F, Fut>(&self, operation: F, id: u64) -> (Probe<T, E>, BoxFuture<'static, ()>)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let executor = self.inner.executor.clone();
        let inner: Weak<Inner<T, E>> = Arc::downgrade(&self.inner);
        let (publish, result) = oneshot::channel();

        let task = async move {
            let invocation = executor.invoke(operation(CancellationToken::new()));
            match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(outcome) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.settle_probe(id, &outcome);
                    }
                    let _ = publish.send(outcome.into_result());
                }
                Err(panic) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.abandon_probe(id);
                    }
                    drop(publish);
                    std::panic::resume_unwind(panic);
                }
            }
        }
        .boxed();

        (result.map(Result::ok).boxed().shared(), task)
    }

    async fn await_probe(
        probe: Probe<T, E>,
        token: &CancellationToken,
    ) -> ResilienceResult<T, E> {
        let result = tokio::select! {
            biased;
            () = token.cancelled() => None,
            result = probe => Some(result),
        };

        match result {
            Some(_) if token.is_cancelled() => Err(ResilienceError::TaskCancelled),
            None | Some(None) => Err(ResilienceError::TaskCancelled),
            Some(Some(result)) => {
                result.map_err(|source| ResilienceError::OperationFailed { source })
            }
        }
    }

    async fn run_closed<F, Fut>(
        &self,
        operation: F,
        token: CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let reason = match self.inner.executor.invoke(operation(token)).await {
            Outcome::Success(value) => {
                let mut core = self.inner.core.lock();
                let state = core.state.public();
                core.strategy.success(state);
                return Ok(value);
            }
            Outcome::Unhandled(error) => {
                return Err(ResilienceError::OperationFailed { source: error });
            }
            Outcome::Failure(reason) => reason,
        };

        let opened = {
            let mut core = self.inner.core.lock();
            let state = core.state.public();
            core.last_failure = Some(reason.clone());
            let should_open = core.strategy.failure(state);
            if should_open && state == CircuitState::Closed {
                self.inner.open(&mut core);
                true
            } else {
                false
            }
        };

        if opened {
            warn!("Circuit breaker opened");
            self.inner.notify(Transition::Opened(reason.clone()));
        }
        reason.into_result().map_err(|source| ResilienceError::OperationFailed { source })
    }
}

impl<T, E> Clone for CircuitBreaker<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T, E> fmt::Debug for CircuitBreaker<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("state", &core.state.public())
            .field("strategy", &core.strategy)
            .field("half_open_after", &self.inner.half_open_after)
            .finish_non_exhaustive()
    }
}

/// Keeps a circuit isolated until released
///
/// Release explicitly with [`dispose`](IsolationHandle::dispose) or by
/// dropping the handle.
#[must_use = "dropping the handle releases the isolation immediately"]
pub struct IsolationHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl IsolationHandle {
    /// Release the isolation now
    pub fn dispose(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for IsolationHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for IsolationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationHandle").field("active", &self.release.is_some()).finish()
    }
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder<T, E> {
    strategy: Box<dyn BreakerStrategy>,
    classifier: Classifier<T, E>,
    half_open_after: ReopenBackoff,
    clock: Arc<dyn Clock>,
    initial_snapshot: Option<StrategySnapshot>,
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    fn new(strategy: Box<dyn BreakerStrategy>) -> Self {
        Self {
            strategy,
            classifier: Classifier::handle_all(),
            half_open_after: Arc::new(ConstantBackoff::new(DEFAULT_HALF_OPEN_AFTER)),
            clock: Arc::new(SystemClock),
            initial_snapshot: None,
        }
    }

    /// Which outcomes count as failures; defaults to every error
    pub fn classifier(mut self, classifier: Classifier<T, E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Constant delay before a probe is let through
    pub fn half_open_after(mut self, delay: Duration) -> Self {
        self.half_open_after = Arc::new(ConstantBackoff::new(delay));
        self
    }

    /// Delay schedule across consecutive reopenings
    pub fn half_open_backoff(
        mut self,
        backoff: impl BackoffFactory<HalfOpenBackoffContext> + 'static,
    ) -> Self {
        self.half_open_after = Arc::new(backoff);
        self
    }

    /// Time source for reopen delays
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Resume the strategy from previously exported counters
    pub fn initial_snapshot(mut self, snapshot: StrategySnapshot) -> Self {
        self.initial_snapshot = Some(snapshot);
        self
    }

    /// Build the breaker, restoring the initial snapshot if one was given
    ///
    /// # Errors
    ///
    /// Fails when the snapshot does not match the strategy.
    pub fn build(mut self) -> ConfigResult<CircuitBreaker<T, E>> {
        if let Some(snapshot) = self.initial_snapshot.take() {
            self.strategy.restore(snapshot)?;
        }

        Ok(CircuitBreaker {
            inner: Arc::new(Inner {
                executor: Executor::new(self.classifier),
                half_open_after: self.half_open_after,
                clock: self.clock,
                core: Mutex::new(Core {
                    state: State::Closed,
                    strategy: self.strategy,
                    last_failure: None,
                }),
                next_probe_id: AtomicU64::new(0),
                on_break: Listeners::new(),
                on_reset: Listeners::new(),
                on_half_open: Listeners::new(),
                on_state_change: Listeners::new(),
            }),
        })
    }
}

impl<T, E> fmt::Debug for CircuitBreakerBuilder<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerBuilder")
            .field("strategy", &self.strategy)
            .field("classifier", &self.classifier)
            .field("half_open_after", &self.half_open_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use thiserror::Error;
    use tokio::sync::oneshot;

    use super::*;
    use crate::backoff::IterableBackoff;
    use crate::breaker::ConsecutiveBreaker;
    use crate::clock::MockClock;

    #[derive(Debug, Clone, PartialEq, Error)]
    enum TestError {
        #[error("unavailable")]
        Unavailable,
        #[error("bad request")]
        BadRequest,
    }

    fn breaker(clock: &MockClock, threshold: u32) -> CircuitBreaker<u32, TestError> {
        CircuitBreaker::builder(ConsecutiveBreaker::new(threshold).unwrap())
            .classifier(Classifier::handle_when(|err| *err == TestError::Unavailable))
            .half_open_after(Duration::from_millis(1000))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    async fn fail(breaker: &CircuitBreaker<u32, TestError>) -> ResilienceResult<u32, TestError> {
        breaker.execute(|_| async { Err(TestError::Unavailable) }).await
    }

    async fn succeed(breaker: &CircuitBreaker<u32, TestError>) -> ResilienceResult<u32, TestError> {
        breaker.execute(|_| async { Ok(1) }).await
    }

    /// Validates opening and fail-fast rejection.
    ///
    /// Assertions:
    /// - Confirms the circuit opens on the threshold failure.
    /// - Confirms open-circuit calls never reach the operation.
    /// - Confirms the last failure is recorded.
    #[tokio::test]
    async fn test_opens_and_rejects_without_invoking() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 2);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.last_failure(), Some(FailureReason::Error(TestError::Unavailable)));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = breaker
            .execute(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::BrokenCircuit)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unhandled_errors_do_not_count() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);

        let result = breaker.execute(|_| async { Err(TestError::BadRequest) }).await;
        assert!(matches!(result, Err(ResilienceError::OperationFailed { source: TestError::BadRequest })));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.last_failure(), None);
    }

    /// Validates a successful half-open probe.
    ///
    /// Assertions:
    /// - Confirms the probe runs once the reopen delay has elapsed.
    /// - Confirms success closes the circuit and clears the streak.
    #[tokio::test]
    async fn test_probe_success_closes() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 2);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;

        clock.advance_millis(999);
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::BrokenCircuit)));

        clock.advance_millis(1);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
        assert_eq!(breaker.state(), CircuitState::Closed);

        // A single failure must not reopen: the streak restarted.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates that failed probes move along the reopen backoff.
    ///
    /// Assertions:
    /// - Confirms the second opening waits for the advanced delay.
    #[tokio::test]
    async fn test_failed_probe_reopens_with_advanced_delay() {
        let clock = MockClock::new();
        let breaker: CircuitBreaker<u32, TestError> =
            CircuitBreaker::builder(ConsecutiveBreaker::new(1).unwrap())
                .half_open_backoff(IterableBackoff::new([
                    Duration::from_millis(100),
                    Duration::from_millis(500),
                ]))
                .clock(clock.clone())
                .build()
                .unwrap();

        let _ = fail(&breaker).await;
        clock.advance_millis(100);
        assert!(matches!(fail(&breaker).await, Err(ResilienceError::OperationFailed { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance_millis(400);
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::BrokenCircuit)));
        clock.advance_millis(100);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
    }

    /// Validates the lenient handling of unhandled probe errors.
    ///
    /// Assertions:
    /// - Confirms the circuit closes.
    /// - Confirms the error still reaches the caller.
    #[tokio::test]
    async fn test_unhandled_probe_error_closes_and_propagates() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let result = breaker.execute(|_| async { Err(TestError::BadRequest) }).await;
        assert!(matches!(result, Err(ResilienceError::OperationFailed { source: TestError::BadRequest })));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates single-flight probing and waiter cancellation.
    ///
    /// Assertions:
    /// - Confirms a waiter cancelled mid-wait gets `TaskCancelled`.
    /// - Confirms the probe still completes for its own caller.
    #[tokio::test]
    async fn test_cancelled_waiter_gets_task_cancelled() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let (release, gate) = oneshot::channel::<()>();
        let launcher = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(move |_| async move {
                        let _ = gate.await;
                        Ok(5)
                    })
                    .await
            })
        };
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let parent = CancellationToken::new();
        let waiter = {
            let breaker = breaker.clone();
            let parent = parent.clone();
            tokio::spawn(async move {
                breaker.execute_with_cancellation(|_| async { Ok(9) }, &parent).await
            })
        };
        tokio::task::yield_now().await;
        parent.cancel();
        let waited = waiter.await.unwrap();
        assert!(matches!(waited, Err(ResilienceError::TaskCancelled)));

        let _ = release.send(());
        assert_eq!(launcher.await.ok().and_then(Result::ok), Some(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates that the trial call outlives a caller that gave up.
    ///
    /// Assertions:
    /// - Confirms a launcher dropped by a timeout leaves the call running.
    /// - Confirms the call completes once and closes the circuit.
    #[tokio::test(start_paused = true)]
    async fn test_dropped_launcher_still_settles_circuit() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let launched = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(move |_| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            }),
        )
        .await;
        assert!(launched.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
    }

    /// Validates that cancelling the launcher does not cancel the trial call.
    ///
    /// Assertions:
    /// - Confirms the launcher gets `TaskCancelled`.
    /// - Confirms the call runs exactly once under a token nobody cancelled.
    /// - Confirms a later caller runs its own operation.
    #[tokio::test]
    async fn test_cancelled_launcher_trial_call_runs_once() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let calls = Arc::new(AtomicUsize::new(0));
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let parent = CancellationToken::new();
        let (release, gate) = oneshot::channel::<u32>();
        let launcher = {
            let breaker = breaker.clone();
            let parent = parent.clone();
            let calls = Arc::clone(&calls);
            let saw_cancel = Arc::clone(&saw_cancel);
            tokio::spawn(async move {
                let operation = move |token: CancellationToken| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let value = gate.await.map_err(|_| TestError::Unavailable);
                    saw_cancel.store(token.is_cancelled(), Ordering::SeqCst);
                    value
                };
                breaker.execute_with_cancellation(operation, &parent).await
            })
        };
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        parent.cancel();
        let launched = launcher.await.unwrap();
        assert!(matches!(launched, Err(ResilienceError::TaskCancelled)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = release.send(4);
        while breaker.state() != CircuitState::Closed {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!saw_cancel.load(Ordering::SeqCst));

        assert_eq!(succeed(&breaker).await.ok(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_caller_is_refused() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let parent = CancellationToken::new();
        parent.cancel();
        let result = breaker
            .execute_with_cancellation(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                },
                &parent,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::TaskCancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
    }

    /// Validates recovery from a trial call that panics.
    ///
    /// Assertions:
    /// - Confirms the waiting caller gets `TaskCancelled`.
    /// - Confirms the circuit reopens with a break event.
    /// - Confirms the next trial call can close it.
    #[tokio::test]
    async fn test_panicking_trial_call_reopens() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let breaks = Arc::new(Mutex::new(Vec::new()));
        let _handle = {
            let breaks = Arc::clone(&breaks);
            breaker.on_break(move |event| breaks.lock().push(event.clone()))
        };
        let _ = fail(&breaker).await;
        clock.advance_millis(1000);

        let result = breaker
            .execute(|_| async {
                let value: Option<u32> = None;
                Ok(value.expect("dependency returned nothing"))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::TaskCancelled)));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaks.lock().last(), Some(&BreakEvent::ProbePanicked));

        clock.advance_millis(1000);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates the order of transition events.
    ///
    /// Assertions:
    /// - Confirms each specific event precedes its generic state change.
    #[tokio::test]
    async fn test_event_order() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let handles = {
            let (a, b, c, d) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
            vec![
                breaker.on_break(move |_| a.lock().push("break".into())),
                breaker.on_half_open(move || b.lock().push("half_open".into())),
                breaker.on_reset(move || c.lock().push("reset".into())),
                breaker.on_state_change(move |state| d.lock().push(state.to_string())),
            ]
        };

        let _ = fail(&breaker).await;
        clock.advance_millis(1000);
        let _ = succeed(&breaker).await;

        assert_eq!(
            *log.lock(),
            vec!["break", "OPEN", "half_open", "HALF_OPEN", "reset", "CLOSED"]
        );
        handles.into_iter().for_each(ListenerHandle::dispose);
    }

    /// Validates isolation while the circuit is already open.
    ///
    /// Assertions:
    /// - Confirms calls fail with `IsolatedCircuit`.
    /// - Confirms dropping the handle closes the circuit.
    #[tokio::test]
    async fn test_isolate_overrides_open_and_drop_releases() {
        let clock = MockClock::new();
        let breaker = breaker(&clock, 1);
        let _ = fail(&breaker).await;

        let handle = breaker.isolate();
        clock.advance_millis(5000);
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::IsolatedCircuit)));

        drop(handle);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.ok(), Some(1));
    }

    /// Validates resuming from a snapshot.
    ///
    /// Assertions:
    /// - Confirms a restored streak opens on the next failure.
    /// - Confirms a snapshot of another strategy fails the build.
    #[tokio::test]
    async fn test_initial_snapshot() {
        let clock = MockClock::new();
        let source = breaker(&clock, 3);
        let _ = fail(&source).await;
        let _ = fail(&source).await;

        let resumed: CircuitBreaker<u32, TestError> =
            CircuitBreaker::builder(ConsecutiveBreaker::new(3).unwrap())
                .initial_snapshot(source.strategy_snapshot())
                .build()
                .unwrap();
        let _ = fail(&resumed).await;
        assert_eq!(resumed.state(), CircuitState::Open);

        let mismatched = CircuitBreaker::<u32, TestError>::builder(
            crate::breaker::CountBreaker::new(0.5, 4).unwrap(),
        )
        .initial_snapshot(source.strategy_snapshot())
        .build();
        assert!(mismatched.is_err());
    }
}
