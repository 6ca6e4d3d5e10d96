//! Backoff generators
//!
//! A backoff is an immutable chain of steps. A [`BackoffFactory`] produces
//! the first step of a chain, and every [`BackoffStep`] produces its
//! successor without mutating itself, so a single factory can seed any number
//! of independent chains (one per retry sequence, one per breaker reopen
//! sequence) without them observing each other.
//!
//! Returning `None` from `next` means "stop": the chain is exhausted and the
//! caller gives up (retry) or keeps its last delay (circuit breaker).
//!
//! The context type `C` is whatever the consuming policy knows about the
//! current attempt. Most generators ignore it; [`DelegateBackoff`] hands it
//! to user code.

mod composite;
mod constant;
mod delegate;
mod exponential;
mod iterable;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use composite::{CompositeBackoff, CompositeBias};
pub use constant::ConstantBackoff;
pub use delegate::DelegateBackoff;
pub use exponential::{ExponentialBackoff, Jitter};
pub use iterable::{Exhaustion, IterableBackoff};

/// One produced delay in a backoff chain
pub trait BackoffStep<C>: Send + Sync + fmt::Debug {
    /// Delay this step asks the caller to wait
    fn duration(&self) -> Duration;

    /// Produce the following step, or `None` to stop
    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>>;
}

/// Produces the first step of a fresh backoff chain
pub trait BackoffFactory<C>: Send + Sync + fmt::Debug {
    /// Produce the first step, or `None` if the chain is empty
    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>>;
}

impl<C, B> BackoffFactory<C> for Arc<B>
where
    B: BackoffFactory<C> + ?Sized,
{
    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        (**self).next(context)
    }
}
