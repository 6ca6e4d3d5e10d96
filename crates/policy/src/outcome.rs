//! Outcome classification
//!
//! A [`Classifier`] decides which results of an operation a policy reacts
//! to. Each attempt is classified exactly once into an [`Outcome`]:
//!
//! - [`Outcome::Success`]: an accepted value,
//! - [`Outcome::Failure`]: a handled failure, either an error matched by the
//!   error predicate or a value matched by the result predicate,
//! - [`Outcome::Unhandled`]: an error no predicate matched. Policies pass it
//!   through untouched, without retrying or counting it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{ListenerHandle, Listeners, SuccessEvent};

type Predicate<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

/// Why an attempt counts as a handled failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason<T, E> {
    /// The operation returned an error matched by the error predicate
    Error(E),
    /// The operation returned a value matched by the result predicate
    Value(T),
}

impl<T, E> FailureReason<T, E> {
    /// True for an error, false for a result
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The error, if this is one
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Error(error) => Some(error),
            Self::Value(_) => None,
        }
    }

    /// The result value, if this is one
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// The shape the operation itself produced: errors stay errors and
    /// unacceptable values are handed back as values.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Error(error) => Err(error),
            Self::Value(value) => Ok(value),
        }
    }
}

/// Classification of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Success(T),
    Failure(FailureReason<T, E>),
    Unhandled(E),
}

impl<T, E> Outcome<T, E> {
    /// True for a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Collapse back into the operation's own result
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(reason) => reason.into_result(),
            Self::Unhandled(error) => Err(error),
        }
    }
}

/// Error and result predicates deciding which outcomes a policy handles
///
/// # Examples
///
/// ```rust
/// use keelson_policy::{Classifier, Outcome};
///
/// let classifier = Classifier::<u16, std::io::Error>::handle_when(|err| {
///     err.kind() == std::io::ErrorKind::TimedOut
/// })
/// .or_result_when(|status| *status >= 500);
///
/// assert!(matches!(classifier.classify(Ok(200)), Outcome::Success(200)));
/// assert!(matches!(classifier.classify(Ok(503)), Outcome::Failure(_)));
/// ```
pub struct Classifier<T, E> {
    errors: Predicate<E>,
    results: Option<Predicate<T>>,
}

impl<T: 'static, E: 'static> Classifier<T, E> {
    /// Handle every error, accept every value
    pub fn handle_all() -> Self {
        Self { errors: Arc::new(|_: &E| true), results: None }
    }

    /// Handle only errors matching `predicate`
    pub fn handle_when<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self { errors: Arc::new(predicate), results: None }
    }

    /// Additionally treat values matching `predicate` as failures
    pub fn or_result_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.results = Some(Arc::new(predicate));
        self
    }

    /// Whether `error` counts as a failure
    pub fn handles_error(&self, error: &E) -> bool {
        (self.errors)(error)
    }

    /// Whether `value` counts as a failure
    pub fn handles_result(&self, value: &T) -> bool {
        self.results.as_ref().is_some_and(|predicate| predicate(value))
    }

    /// Classify the result of one attempt
    pub fn classify(&self, result: Result<T, E>) -> Outcome<T, E> {
        match result {
            Ok(value) if self.handles_result(&value) => {
                Outcome::Failure(FailureReason::Value(value))
            }
            Ok(value) => Outcome::Success(value),
            Err(error) if self.handles_error(&error) => {
                Outcome::Failure(FailureReason::Error(error))
            }
            Err(error) => Outcome::Unhandled(error),
        }
    }
}

impl<T: 'static, E: 'static> Default for Classifier<T, E> {
    fn default() -> Self {
        Self::handle_all()
    }
}

impl<T, E> Clone for Classifier<T, E> {
    fn clone(&self) -> Self {
        Self { errors: Arc::clone(&self.errors), results: self.results.clone() }
    }
}

impl<T, E> fmt::Debug for Classifier<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("errors", &"<predicate>")
            .field("results", &self.results.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Emitted when an execution failed, handled or not
#[derive(Debug)]
pub struct FailureEvent<T, E> {
    /// Time spent in the operation
    pub duration: Duration,
    /// Whether the classifier handled the failure
    pub handled: bool,
    /// The failed error or result
    pub reason: FailureReason<T, E>,
}

impl<T, E> FailureEvent<T, E> {
    fn into_outcome(self) -> Outcome<T, E> {
        match (self.handled, self.reason) {
            (true, reason) => Outcome::Failure(reason),
            (false, FailureReason::Error(error)) => Outcome::Unhandled(error),
            // Only errors can be unhandled; an unmatched value is a success.
            (false, FailureReason::Value(value)) => Outcome::Success(value),
        }
    }
}

/// Runs attempts, classifies them and reports success/failure events
pub(crate) struct Executor<T, E> {
    classifier: Classifier<T, E>,
    on_success: Arc<Listeners<SuccessEvent>>,
    on_failure: Arc<Listeners<FailureEvent<T, E>>>,
}

impl<T: 'static, E: 'static> Executor<T, E> {
    pub(crate) fn new(classifier: Classifier<T, E>) -> Self {
        Self {
            classifier,
            on_success: Arc::new(Listeners::new()),
            on_failure: Arc::new(Listeners::new()),
        }
    }

    pub(crate) fn on_success<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.on_success.add(listener)
    }

    pub(crate) fn on_failure<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&FailureEvent<T, E>) + Send + Sync + 'static,
    {
        self.on_failure.add(listener)
    }

    /// Await one attempt and classify it
    pub(crate) async fn invoke<Fut>(&self, attempt: Fut) -> Outcome<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = tokio::time::Instant::now();
        let result = attempt.await;
        let duration = started.elapsed();

        match self.classifier.classify(result) {
            Outcome::Success(value) => {
                self.on_success.emit(&SuccessEvent { duration });
                Outcome::Success(value)
            }
            Outcome::Failure(reason) => {
                let event = FailureEvent { duration, handled: true, reason };
                self.on_failure.emit(&event);
                event.into_outcome()
            }
            Outcome::Unhandled(error) => {
                let event =
                    FailureEvent { duration, handled: false, reason: FailureReason::Error(error) };
                self.on_failure.emit(&event);
                event.into_outcome()
            }
        }
    }
}

impl<T, E> Clone for Executor<T, E> {
    fn clone(&self) -> Self {
        Self {
            classifier: self.classifier.clone(),
            on_success: Arc::clone(&self.on_success),
            on_failure: Arc::clone(&self.on_failure),
        }
    }
}

impl<T, E> fmt::Debug for Executor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").field("classifier", &self.classifier).finish()
    }
}
