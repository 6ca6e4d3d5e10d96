//! Retry engine
//!
//! Re-runs an operation after handled failures, waiting between attempts as
//! dictated by a backoff chain. Every call to [`RetryPolicy::execute`] seeds
//! its own chain from the configured factory, so concurrent calls never share
//! backoff progress.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backoff::{BackoffFactory, BackoffStep, ExponentialBackoff};
use crate::config::RetryConfig;
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::events::{ListenerHandle, Listeners, SuccessEvent};
use crate::outcome::{Classifier, Executor, FailureEvent, FailureReason, Outcome};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Context handed to the backoff when a retry is being scheduled
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoffContext<T, E> {
    /// Number of the retry being scheduled, starting at 1
    pub attempt: u32,
    /// Failure that triggered this retry
    pub reason: FailureReason<T, E>,
}

/// Passed to the operation on every attempt
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 0 for the first call, then 1, 2, ... for each retry
    pub attempt: u32,
    /// Cancelled when the caller's token is cancelled
    pub cancellation: CancellationToken,
}

/// Emitted before waiting for a retry
#[derive(Debug, Clone)]
pub struct RetryEvent<T, E> {
    /// Retry number, starting at 1
    pub attempt: u32,
    /// Time waited before the retry
    pub delay: Duration,
    /// Failure that triggered the retry
    pub reason: FailureReason<T, E>,
}

/// Emitted once when the policy stops retrying a failing operation
#[derive(Debug, Clone)]
pub struct GiveUpEvent<T, E> {
    /// Total number of times the operation ran
    pub attempts: u32,
    /// The last handled failure, surfaced to the caller
    pub reason: FailureReason<T, E>,
}

type RetryBackoff<T, E> = Arc<dyn BackoffFactory<RetryBackoffContext<T, E>>>;

struct RetryInner<T, E> {
    executor: Executor<T, E>,
    max_attempts: u32,
    backoff: RetryBackoff<T, E>,
    on_retry: Listeners<RetryEvent<T, E>>,
    on_give_up: Listeners<GiveUpEvent<T, E>>,
}

/// Retries handled failures under a backoff schedule
///
/// Cloning is cheap and clones share configuration and listeners.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use keelson_policy::backoff::ConstantBackoff;
/// use keelson_policy::RetryPolicy;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let retry = RetryPolicy::<u32, std::io::Error>::builder()
///     .max_attempts(2)
///     .backoff(ConstantBackoff::new(Duration::from_millis(1)))
///     .build();
///
/// let value = retry
///     .execute(|ctx| async move {
///         if ctx.attempt < 2 {
///             Err(std::io::Error::other("flaky"))
///         } else {
///             Ok(ctx.attempt)
///         }
///     })
///     .await;
/// assert_eq!(value.ok(), Some(2));
/// # }
/// ```
pub struct RetryPolicy<T, E> {
    inner: Arc<RetryInner<T, E>>,
}

impl<T, E> RetryPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start building a policy with the default backoff and attempt limit
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }

    /// Build a policy from its serializable configuration
    pub fn from_config(config: &RetryConfig, classifier: Classifier<T, E>) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::builder()
            .classifier(classifier)
            .max_attempts(config.max_attempts)
            .backoff(config.backoff.build::<RetryBackoffContext<T, E>>()?)
            .build())
    }

    /// Retries allowed after the first attempt
    pub fn max_attempts(&self) -> u32 {
        self.inner.max_attempts
    }

    /// Listen for scheduled retries
    pub fn on_retry<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&RetryEvent<T, E>) + Send + Sync + 'static,
    {
        self.inner.on_retry.add(listener)
    }

    /// Listen for the final failure of an execution
    pub fn on_give_up<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&GiveUpEvent<T, E>) + Send + Sync + 'static,
    {
        self.inner.on_give_up.add(listener)
    }

    /// Listen for every successful attempt
    pub fn on_success<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.inner.executor.on_success(listener)
    }

    /// Listen for every failed attempt, handled or not
    pub fn on_failure<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&FailureEvent<T, E>) + Send + Sync + 'static,
    {
        self.inner.executor.on_failure(listener)
    }

    /// Run `operation`, retrying handled failures
    pub async fn execute<F, Fut>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new()).await
    }

    /// Run `operation` under a token derived from `parent`
    ///
    /// Cancelling `parent` stops further retries: a pending wait ends at
    /// once and the last handled failure is surfaced.
    #[instrument(skip_all, fields(max_attempts = self.inner.max_attempts))]
    pub async fn execute_with_cancellation<F, Fut>(
        &self,
        mut operation: F,
        parent: &CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let inner = &self.inner;
        let token = parent.child_token();
        let mut step: Option<Box<dyn BackoffStep<RetryBackoffContext<T, E>>>> = None;
        let mut attempt = 0_u32;

        loop {
            let context = RetryContext { attempt, cancellation: token.clone() };
            let reason = match inner.executor.invoke(operation(context)).await {
                Outcome::Success(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Outcome::Unhandled(error) => {
                    return Err(ResilienceError::OperationFailed { source: error });
                }
                Outcome::Failure(reason) => reason,
            };

            if token.is_cancelled() || attempt >= inner.max_attempts {
                return self.give_up(attempt + 1, reason);
            }

            let backoff_context = RetryBackoffContext { attempt: attempt + 1, reason };
            let next = match &step {
                Some(prior) => prior.next(&backoff_context),
                None => inner.backoff.next(&backoff_context),
            };
            let reason = backoff_context.reason;
            let Some(next) = next else {
                debug!("Backoff exhausted after {} attempts", attempt + 1);
                return self.give_up(attempt + 1, reason);
            };

            attempt += 1;
            let delay = next.duration();
            step = Some(next);

            let event = RetryEvent { attempt, delay, reason };
            inner.on_retry.emit(&event);
            let reason = event.reason;
            debug!("Handled failure, retry {} after {:?}", attempt, delay);

            let cancelled = tokio::select! {
                biased;
                () = token.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                debug!("Cancelled while waiting to retry");
                return self.give_up(attempt, reason);
            }
        }
    }

    fn give_up(&self, attempts: u32, reason: FailureReason<T, E>) -> ResilienceResult<T, E> {
        warn!("Giving up after {} attempts", attempts);
        let event = GiveUpEvent { attempts, reason };
        self.inner.on_give_up.emit(&event);

        match event.reason {
            FailureReason::Error(error) => Err(ResilienceError::OperationFailed { source: error }),
            FailureReason::Value(value) => Ok(value),
        }
    }
}

impl<T, E> Clone for RetryPolicy<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T, E> fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.inner.max_attempts)
            .field("backoff", &self.inner.backoff)
            .field("executor", &self.inner.executor)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RetryPolicy`]
pub struct RetryPolicyBuilder<T, E> {
    classifier: Classifier<T, E>,
    max_attempts: u32,
    backoff: Option<RetryBackoff<T, E>>,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Same as [`RetryPolicy::builder`]
    pub fn new() -> Self {
        Self {
            classifier: Classifier::handle_all(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: None,
        }
    }

    /// Which outcomes are retried; defaults to every error
    pub fn classifier(mut self, classifier: Classifier<T, E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Retries after the first attempt; 0 disables retrying
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay schedule; defaults to [`ExponentialBackoff::default`]
    pub fn backoff(
        mut self,
        backoff: impl BackoffFactory<RetryBackoffContext<T, E>> + 'static,
    ) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Finish the policy
    pub fn build(self) -> RetryPolicy<T, E> {
        let backoff: RetryBackoff<T, E> = match self.backoff {
            Some(backoff) => backoff,
            None => Arc::new(ExponentialBackoff::default()),
        };
        RetryPolicy {
            inner: Arc::new(RetryInner {
                executor: Executor::new(self.classifier),
                max_attempts: self.max_attempts,
                backoff,
                on_retry: Listeners::new(),
                on_give_up: Listeners::new(),
            }),
        }
    }
}

impl<T, E> Default for RetryPolicyBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for RetryPolicyBuilder<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicyBuilder")
            .field("classifier", &self.classifier)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}
