use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BackoffFactory, BackoffStep};

/// Which child delay a [`CompositeBackoff`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeBias {
    A,
    B,
    Min,
    Max,
}

impl CompositeBias {
    fn pick(self, a: Duration, b: Duration) -> Duration {
        match self {
            Self::A => a,
            Self::B => b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// Runs two backoffs side by side
///
/// Both children advance on every step and the chain stops as soon as either
/// of them stops.
pub struct CompositeBackoff<C> {
    bias: CompositeBias,
    a: Arc<dyn BackoffFactory<C>>,
    b: Arc<dyn BackoffFactory<C>>,
}

impl<C> CompositeBackoff<C> {
    /// Combine `a` and `b`, picking delays by `bias`
    pub fn new(
        bias: CompositeBias,
        a: impl BackoffFactory<C> + 'static,
        b: impl BackoffFactory<C> + 'static,
    ) -> Self {
        Self { bias, a: Arc::new(a), b: Arc::new(b) }
    }

    /// How delays from the two chains are combined
    pub fn bias(&self) -> CompositeBias {
        self.bias
    }
}

impl<C> Clone for CompositeBackoff<C> {
    fn clone(&self) -> Self {
        Self { bias: self.bias, a: Arc::clone(&self.a), b: Arc::clone(&self.b) }
    }
}

impl<C> std::fmt::Debug for CompositeBackoff<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBackoff")
            .field("bias", &self.bias)
            .field("a", &self.a)
            .field("b", &self.b)
            .finish()
    }
}

struct CompositeStep<C> {
    bias: CompositeBias,
    a: Box<dyn BackoffStep<C>>,
    b: Box<dyn BackoffStep<C>>,
}

impl<C> std::fmt::Debug for CompositeStep<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeStep")
            .field("bias", &self.bias)
            .field("a", &self.a)
            .field("b", &self.b)
            .finish()
    }
}

impl<C> CompositeStep<C> {
    fn join(
        bias: CompositeBias,
        a: Option<Box<dyn BackoffStep<C>>>,
        b: Option<Box<dyn BackoffStep<C>>>,
    ) -> Option<Self> {
        Some(Self { bias, a: a?, b: b? })
    }
}

impl<C: 'static> BackoffStep<C> for CompositeStep<C> {
    fn duration(&self) -> Duration {
        self.bias.pick(self.a.duration(), self.b.duration())
    }

    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = CompositeStep::join(self.bias, self.a.next(context), self.b.next(context))?;
        Some(Box::new(step))
    }
}

impl<C: 'static> BackoffFactory<C> for CompositeBackoff<C> {
    fn next(&self, context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = CompositeStep::join(self.bias, self.a.next(context), self.b.next(context))?;
        Some(Box::new(step))
    }
}
