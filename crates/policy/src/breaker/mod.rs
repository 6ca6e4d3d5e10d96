//! Breaker strategies
//!
//! A strategy answers one question for the circuit breaker: given the stream
//! of handled successes and failures, should the circuit open now? The
//! current [`CircuitState`] is passed along with every signal so that a
//! strategy can tell the success of a half-open probe (which starts a clean
//! slate) from an ordinary closed-state success.
//!
//! Every strategy can export its counters as a [`StrategySnapshot`] and
//! import them again into a fresh instance of the same kind and size.

mod consecutive;
mod count;
mod sampling;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use consecutive::ConsecutiveBreaker;
pub use count::CountBreaker;
pub use sampling::SamplingBreaker;

use crate::error::{ConfigError, ConfigResult};

/// Public view of a circuit breaker's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the reopen delay has passed
    Open,
    /// A single probe call decides whether to close again
    HalfOpen,
    /// Manually held open through `isolate()`
    Isolated,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
            Self::Isolated => write!(f, "ISOLATED"),
        }
    }
}

/// Decides when a circuit should open
pub trait BreakerStrategy: Send + fmt::Debug {
    /// Record a successful call made while the circuit was in `state`
    fn success(&mut self, state: CircuitState);

    /// Record a handled failure; `true` means the circuit should open
    fn failure(&mut self, state: CircuitState) -> bool;

    /// Export the current counters
    fn snapshot(&self) -> StrategySnapshot;

    /// Replace the counters with a previously exported snapshot
    ///
    /// Fails with [`ConfigError::Invalid`] when the snapshot came from a
    /// different kind of strategy or one with a different size.
    fn restore(&mut self, snapshot: StrategySnapshot) -> ConfigResult<()>;
}

impl<S: BreakerStrategy + ?Sized> BreakerStrategy for Box<S> {
    fn success(&mut self, state: CircuitState) {
        (**self).success(state);
    }

    fn failure(&mut self, state: CircuitState) -> bool {
        (**self).failure(state)
    }

    fn snapshot(&self) -> StrategySnapshot {
        (**self).snapshot()
    }

    fn restore(&mut self, snapshot: StrategySnapshot) -> ConfigResult<()> {
        (**self).restore(snapshot)
    }
}

/// Opaque, serializable export of a strategy's counters
///
/// Treat the serialized form as a versioned blob: store it and feed it back
/// to [`BreakerStrategy::restore`], without depending on its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategySnapshot(pub(crate) SnapshotState);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum SnapshotState {
    Consecutive { count: u32 },
    Count { samples: Vec<Option<bool>>, cursor: usize },
    Sampling { windows: Vec<WindowSnapshot>, current: usize },
}

impl SnapshotState {
    fn kind(&self) -> &'static str {
        match self {
            Self::Consecutive { .. } => "consecutive",
            Self::Count { .. } => "count",
            Self::Sampling { .. } => "sampling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WindowSnapshot {
    pub(crate) age_ms: u64,
    pub(crate) successes: u64,
    pub(crate) failures: u64,
}

fn kind_mismatch(expected: &str, snapshot: &SnapshotState) -> ConfigError {
    ConfigError::invalid(format!(
        "cannot restore a {} snapshot into a {expected} breaker",
        snapshot.kind()
    ))
}

fn validate_threshold(threshold: f64) -> ConfigResult<()> {
    if threshold > 0.0 && threshold < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(
            "threshold",
            format!("must be in (0, 1), got {threshold}"),
        ))
    }
}
