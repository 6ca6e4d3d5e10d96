use super::{kind_mismatch, BreakerStrategy, CircuitState, SnapshotState, StrategySnapshot};
use crate::error::{ConfigError, ConfigResult};

/// Opens after `threshold` handled failures in a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsecutiveBreaker {
    threshold: u32,
    count: u32,
}

impl ConsecutiveBreaker {
    /// Create a breaker opening on the `threshold`-th consecutive failure
    pub fn new(threshold: u32) -> ConfigResult<Self> {
        if threshold == 0 {
            return Err(ConfigError::out_of_range("threshold", "must be at least 1"));
        }
        Ok(Self { threshold, count: 0 })
    }

    /// Failures in a row that open the circuit
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Failures seen since the last success
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl BreakerStrategy for ConsecutiveBreaker {
    fn success(&mut self, _state: CircuitState) {
        self.count = 0;
    }

    fn failure(&mut self, _state: CircuitState) -> bool {
        self.count = self.count.saturating_add(1);
        self.count >= self.threshold
    }

    fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot(SnapshotState::Consecutive { count: self.count })
    }

    fn restore(&mut self, snapshot: StrategySnapshot) -> ConfigResult<()> {
        match snapshot.0 {
            SnapshotState::Consecutive { count } => {
                self.count = count;
                Ok(())
            }
            other => Err(kind_mismatch("consecutive", &other)),
        }
    }
}
