use std::time::Duration;

use super::{BackoffFactory, BackoffStep};

/// Same delay for every step, optionally limited to a number of steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff {
    interval: Duration,
    limit: Option<u32>,
}

impl ConstantBackoff {
    /// Unlimited chain of `interval` delays
    pub fn new(interval: Duration) -> Self {
        Self { interval, limit: None }
    }

    /// Stop after `limit` steps have been produced
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Delay between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// Steps are numbered from 1; `index` is how many steps the chain holds so far.
#[derive(Debug, Clone, Copy)]
struct ConstantStep {
    interval: Duration,
    limit: Option<u32>,
    index: u32,
}

impl ConstantStep {
    fn first(backoff: &ConstantBackoff) -> Option<Self> {
        if backoff.limit == Some(0) {
            return None;
        }
        Some(Self { interval: backoff.interval, limit: backoff.limit, index: 1 })
    }
}

impl<C> BackoffStep<C> for ConstantStep {
    fn duration(&self) -> Duration {
        self.interval
    }

    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        if self.limit.is_some_and(|limit| self.index >= limit) {
            return None;
        }
        Some(Box::new(Self { index: self.index + 1, ..*self }))
    }
}

impl<C> BackoffFactory<C> for ConstantBackoff {
    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        ConstantStep::first(self).map(|step| Box::new(step) as Box<dyn BackoffStep<C>>)
    }
}
