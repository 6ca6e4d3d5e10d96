use super::{
    kind_mismatch, validate_threshold, BreakerStrategy, CircuitState, SnapshotState,
    StrategySnapshot,
};
use crate::error::{ConfigError, ConfigResult};

/// Opens when the failure rate over the last `size` calls exceeds a threshold
///
/// Samples live in a fixed ring overwriting the oldest entry; the success
/// and failure totals are adjusted as samples are overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct CountBreaker {
    threshold: f64,
    minimum_calls: usize,
    // `Some(true)` is a success, `Some(false)` a failure, `None` an empty slot.
    samples: Vec<Option<bool>>,
    cursor: usize,
    successes: usize,
    failures: usize,
}

impl CountBreaker {
    /// Breaker over the last `size` calls, requiring a full window of calls
    pub fn new(threshold: f64, size: usize) -> ConfigResult<Self> {
        Self::with_minimum_calls(threshold, size, size)
    }

    /// Breaker that may open once `minimum_calls` have been recorded
    pub fn with_minimum_calls(
        threshold: f64,
        size: usize,
        minimum_calls: usize,
    ) -> ConfigResult<Self> {
        validate_threshold(threshold)?;
        if size == 0 {
            return Err(ConfigError::out_of_range("size", "must be at least 1"));
        }
        if minimum_calls == 0 || minimum_calls > size {
            return Err(ConfigError::out_of_range(
                "minimum_calls",
                format!("must be in 1..={size}, got {minimum_calls}"),
            ));
        }

        Ok(Self {
            threshold,
            minimum_calls,
            samples: vec![None; size],
            cursor: 0,
            successes: 0,
            failures: 0,
        })
    }

    /// Calls the window holds when full
    pub fn size(&self) -> usize {
        self.samples.len()
    }

    /// Calls currently held in the window
    pub fn total_calls(&self) -> usize {
        self.successes + self.failures
    }

    /// Failures currently held in the window
    pub fn failures(&self) -> usize {
        self.failures
    }

    fn record(&mut self, success: bool) {
        match self.samples[self.cursor].replace(success) {
            Some(true) => self.successes -= 1,
            Some(false) => self.failures -= 1,
            None => {}
        }
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.cursor = (self.cursor + 1) % self.samples.len();
    }

    fn reset(&mut self) {
        self.samples.iter_mut().for_each(|sample| *sample = None);
        self.cursor = 0;
        self.successes = 0;
        self.failures = 0;
    }
}

impl BreakerStrategy for CountBreaker {
    fn success(&mut self, state: CircuitState) {
        if state == CircuitState::HalfOpen {
            self.reset();
        }
        self.record(true);
    }

    fn failure(&mut self, state: CircuitState) -> bool {
        self.record(false);
        if state != CircuitState::Closed {
            return true;
        }

        let total = self.total_calls();
        total >= self.minimum_calls && self.failures as f64 > self.threshold * total as f64
    }

    fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot(SnapshotState::Count { samples: self.samples.clone(), cursor: self.cursor })
    }

    fn restore(&mut self, snapshot: StrategySnapshot) -> ConfigResult<()> {
        let (samples, cursor) = match snapshot.0 {
            SnapshotState::Count { samples, cursor } => (samples, cursor),
            other => return Err(kind_mismatch("count", &other)),
        };
        if samples.len() != self.samples.len() || cursor >= samples.len() {
            return Err(ConfigError::invalid(format!(
                "count snapshot holds {} samples (cursor {cursor}), breaker size is {}",
                samples.len(),
                self.samples.len()
            )));
        }

        self.successes = samples.iter().filter(|s| **s == Some(true)).count();
        self.failures = samples.iter().filter(|s| **s == Some(false)).count();
        self.samples = samples;
        self.cursor = cursor;
        Ok(())
    }
}
