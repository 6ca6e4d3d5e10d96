use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{BackoffFactory, BackoffStep};

type DelegateFn<C, S> = Arc<dyn Fn(&C, Option<&S>) -> Option<(Duration, S)> + Send + Sync>;

/// Backoff driven by a user function
///
/// The function receives the caller's context and the state returned by the
/// previous step of the same chain (`None` for the first step), and returns
/// the next delay with the state to thread forward, or `None` to stop.
///
/// # Examples
///
/// Stop as soon as the same status code shows up twice in a row:
///
/// ```rust
/// use std::time::Duration;
/// use keelson_policy::backoff::{BackoffFactory, DelegateBackoff};
///
/// let backoff = DelegateBackoff::new(|status: &u16, previous: Option<&u16>| match previous {
///     Some(seen) if seen == status => None,
///     _ => Some((Duration::from_millis(100), *status)),
/// });
///
/// let first = backoff.next(&503).unwrap();
/// assert!(first.next(&502).is_some());
/// assert!(first.next(&503).is_none());
/// ```
pub struct DelegateBackoff<C, S> {
    delegate: DelegateFn<C, S>,
}

impl<C, S> DelegateBackoff<C, S>
where
    C: 'static,
    S: Send + Sync + 'static,
{
    /// Wrap a function of the context and the previous state
    pub fn new<F>(delegate: F) -> Self
    where
        F: Fn(&C, Option<&S>) -> Option<(Duration, S)> + Send + Sync + 'static,
    {
        Self { delegate: Arc::new(delegate) }
    }
}

impl<C: 'static> DelegateBackoff<C, ()> {
    /// Delegate that only looks at the context
    pub fn stateless<F>(delegate: F) -> Self
    where
        F: Fn(&C) -> Option<Duration> + Send + Sync + 'static,
    {
        Self::new(move |context: &C, _: Option<&()>| delegate(context).map(|delay| (delay, ())))
    }
}

impl<C, S> Clone for DelegateBackoff<C, S> {
    fn clone(&self) -> Self {
        Self { delegate: Arc::clone(&self.delegate) }
    }
}

impl<C, S> fmt::Debug for DelegateBackoff<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateBackoff").field("delegate", &"<function>").finish()
    }
}

struct DelegateStep<C, S> {
    delegate: DelegateFn<C, S>,
    duration: Duration,
    state: S,
}

impl<C, S> DelegateStep<C, S> {
    fn produce(delegate: &DelegateFn<C, S>, context: &C, prior: Option<&S>) -> Option<Self> {
        let (duration, state) = delegate(context, prior)?;
        Some(Self { delegate: Arc::clone(delegate), duration, state })
    }
}

impl<C, S> fmt::Debug for DelegateStep<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateStep").field("duration", &self.duration).finish_non_exhaustive()
    }
}

impl<C, S> BackoffStep<C> for DelegateStep<C, S>
where
    C: 'static,
    S: Send + Sync + 'static,
{
    fn duration(&self) -> Duration {
        self.duration
    }

    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = Self::produce(&self.delegate, context, Some(&self.state))?;
        Some(Box::new(step))
    }
}

impl<C, S> BackoffFactory<C> for DelegateBackoff<C, S>
where
    C: 'static,
    S: Send + Sync + 'static,
{
    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = DelegateStep::produce(&self.delegate, context, None)?;
        Some(Box::new(step))
    }
}
