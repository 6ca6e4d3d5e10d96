use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    kind_mismatch, validate_threshold, BreakerStrategy, CircuitState, SnapshotState,
    StrategySnapshot, WindowSnapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

const MIN_BUCKETS: u64 = 5;
const MAX_BUCKET_MS: u64 = 1_000;
/// Failures per second the default minimum rate asks for at the threshold
const DEFAULT_FAILURES_PER_SECOND: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    successes: u64,
    failures: u64,
}

impl Window {
    fn empty(started_at: Instant) -> Self {
        Self { started_at, successes: 0, failures: 0 }
    }
}

/// Opens when the failure rate over a sliding time window exceeds a threshold
///
/// The window is a ring of time buckets (at least five, none longer than one
/// second). Crossing a bucket boundary rotates the oldest bucket out and
/// subtracts its counts from the rolling totals. The breaker only considers
/// opening once the window has seen enough traffic to meet the minimum
/// request rate.
pub struct SamplingBreaker {
    threshold: f64,
    duration: Duration,
    minimum_rps: f64,
    bucket_width: Duration,
    clock: Arc<dyn Clock>,
    windows: Vec<Window>,
    current: usize,
    successes: u64,
    failures: u64,
}

impl SamplingBreaker {
    /// Breaker over `duration` with the default minimum request rate
    ///
    /// The default rate is the one at which a failure rate equal to
    /// `threshold` amounts to five failures per second.
    pub fn new(threshold: f64, duration: Duration) -> ConfigResult<Self> {
        validate_threshold(threshold)?;
        Self::with_minimum_rps(threshold, duration, DEFAULT_FAILURES_PER_SECOND / threshold)
    }

    /// Create a breaker that ignores windows below `minimum_rps` calls per second
    ///
    /// # Errors
    ///
    /// Fails on a threshold outside (0, 1), a window under 1ms or a
    /// non-positive rate.
    pub fn with_minimum_rps(
        threshold: f64,
        duration: Duration,
        minimum_rps: f64,
    ) -> ConfigResult<Self> {
        validate_threshold(threshold)?;
        if duration < Duration::from_millis(1) {
            return Err(ConfigError::out_of_range("duration", "must be at least 1ms"));
        }
        if !minimum_rps.is_finite() || minimum_rps <= 0.0 {
            return Err(ConfigError::out_of_range(
                "minimum_rps",
                format!("must be a positive number, got {minimum_rps}"),
            ));
        }

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let buckets = MIN_BUCKETS.max(duration_ms.div_ceil(MAX_BUCKET_MS));
        let bucket_width = Duration::from_millis(duration_ms.div_ceil(buckets));
        let bucket_count = usize::try_from(buckets)
            .map_err(|_| ConfigError::out_of_range("duration", "window is too long"))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        Ok(Self {
            threshold,
            duration,
            minimum_rps,
            bucket_width,
            clock,
            windows: vec![Window::empty(now); bucket_count],
            current: 0,
            successes: 0,
            failures: 0,
        })
    }

    /// Read time from `clock` instead of the system clock
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self.reset();
        self
    }

    /// Number of time buckets in the window
    pub fn bucket_count(&self) -> usize {
        self.windows.len()
    }

    /// Time covered by one bucket
    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Calls per second below which the breaker never opens
    pub fn minimum_rps(&self) -> f64 {
        self.minimum_rps
    }

    /// Calls recorded across the live window
    pub fn total_calls(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failures recorded across the live window
    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn reset(&mut self) {
        let now = self.clock.now();
        self.windows.iter_mut().for_each(|window| *window = Window::empty(now));
        self.current = 0;
        self.successes = 0;
        self.failures = 0;
    }

    /// Advance the current bucket to the one covering `now`
    fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.windows[self.current].started_at);
        if elapsed < self.bucket_width {
            return;
        }

        let crossed = elapsed.as_nanos() / self.bucket_width.as_nanos();
        if crossed >= self.windows.len() as u128 {
            self.reset();
            return;
        }

        let mut started_at = self.windows[self.current].started_at;
        for _ in 0..crossed {
            started_at += self.bucket_width;
            self.current = (self.current + 1) % self.windows.len();
            let expired =
                std::mem::replace(&mut self.windows[self.current], Window::empty(started_at));
            self.successes = self.successes.saturating_sub(expired.successes);
            self.failures = self.failures.saturating_sub(expired.failures);
        }
    }

    fn record(&mut self, success: bool) {
        let now = self.clock.now();
        self.rotate(now);

        let window = &mut self.windows[self.current];
        if success {
            window.successes = window.successes.saturating_add(1);
            self.successes = self.successes.saturating_add(1);
        } else {
            window.failures = window.failures.saturating_add(1);
            self.failures = self.failures.saturating_add(1);
        }
    }

    fn should_open(&self) -> bool {
        let total = self.total_calls() as f64;
        total >= self.minimum_rps * self.duration.as_secs_f64()
            && self.failures as f64 > self.threshold * total
    }
}

impl BreakerStrategy for SamplingBreaker {
    fn success(&mut self, state: CircuitState) {
        if state == CircuitState::HalfOpen {
            self.reset();
        }
        self.record(true);
    }

    fn failure(&mut self, state: CircuitState) -> bool {
        self.record(false);
        state != CircuitState::Closed || self.should_open()
    }

    fn snapshot(&self) -> StrategySnapshot {
        let now = self.clock.now();
        let windows = self
            .windows
            .iter()
            .map(|window| WindowSnapshot {
                age_ms: u64::try_from(now.saturating_duration_since(window.started_at).as_millis())
                    .unwrap_or(u64::MAX),
                successes: window.successes,
                failures: window.failures,
            })
            .collect();
        StrategySnapshot(SnapshotState::Sampling { windows, current: self.current })
    }

    fn restore(&mut self, snapshot: StrategySnapshot) -> ConfigResult<()> {
        let (windows, current) = match snapshot.0 {
            SnapshotState::Sampling { windows, current } => (windows, current),
            other => return Err(kind_mismatch("sampling", &other)),
        };
        if windows.len() != self.windows.len() || current >= windows.len() {
            return Err(ConfigError::invalid(format!(
                "sampling snapshot holds {} buckets (current {current}), breaker has {}",
                windows.len(),
                self.windows.len()
            )));
        }

        let overflow = || ConfigError::invalid("sampling snapshot counts overflow u64");
        let successes = windows
            .iter()
            .try_fold(0_u64, |total, window| total.checked_add(window.successes))
            .ok_or_else(overflow)?;
        let failures = windows
            .iter()
            .try_fold(0_u64, |total, window| total.checked_add(window.failures))
            .ok_or_else(overflow)?;
        successes.checked_add(failures).ok_or_else(overflow)?;

        let now = self.clock.now();
        self.windows = windows
            .iter()
            .map(|window| Window {
                started_at: now.checked_sub(Duration::from_millis(window.age_ms)).unwrap_or(now),
                successes: window.successes,
                failures: window.failures,
            })
            .collect();
        self.current = current;
        self.successes = successes;
        self.failures = failures;
        Ok(())
    }
}

impl fmt::Debug for SamplingBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingBreaker")
            .field("threshold", &self.threshold)
            .field("duration", &self.duration)
            .field("minimum_rps", &self.minimum_rps)
            .field("buckets", &self.windows.len())
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}
