use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BackoffFactory, BackoffStep};
use crate::error::{ConfigError, ConfigResult};

/// Decorrelated jitter tuning, chosen so the expected delays track the plain
/// exponential curve.
const DECORRELATED_P_FACTOR: f64 = 4.0;
const DECORRELATED_RP_SCALING: f64 = 1.0 / 1.4;

/// Randomization applied to each exponential delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact `min(max_delay, initial_delay * exponent^k)`
    None,
    /// Uniform in `[0, d)`
    Full,
    /// Uniform in `[d / 2, d)`
    Equal,
    /// Each delay randomized relative to the previous one
    #[default]
    Decorrelated,
}

/// Exponentially growing delays with optional jitter
///
/// Step `k` (the first step is `k = 0`) waits
/// `min(max_delay, initial_delay * exponent^k)` before jitter is applied.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use keelson_policy::backoff::{BackoffFactory, ExponentialBackoff, Jitter};
///
/// let backoff = ExponentialBackoff::default().with_jitter(Jitter::None);
/// let first = BackoffFactory::<()>::next(&backoff, &()).unwrap();
/// assert_eq!(first.duration(), Duration::from_millis(128));
/// assert_eq!(first.next(&()).unwrap().duration(), Duration::from_millis(256));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    exponent: f64,
    jitter: Jitter,
    max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(128),
            max_delay: Duration::from_secs(30),
            exponent: 2.0,
            jitter: Jitter::Decorrelated,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    /// Same as [`ExponentialBackoff::default`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay of the first step
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound for every delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between steps
    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }

    /// Randomization applied to each delay
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop after `attempts` steps
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay of the first step
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Upper bound for every delay
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Randomization applied to each delay
    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.exponent.is_finite() || self.exponent < 1.0 {
            return Err(ConfigError::out_of_range(
                "exponent",
                format!("must be a finite number >= 1, got {}", self.exponent),
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(ConfigError::out_of_range("initial_delay", "must be greater than 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(format!(
                "max_delay ({:?}) cannot be less than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        Ok(())
    }

    fn base_millis(&self, attempt: u32) -> f64 {
        let max = self.max_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (self.initial_delay.as_secs_f64() * 1000.0 * self.exponent.powi(exponent)).min(max)
    }

    /// Delay for step `attempt` plus the state carried to the next step
    fn delay(&self, attempt: u32, previous: f64) -> (f64, f64) {
        let mut rng = rand::thread_rng();
        match self.jitter {
            Jitter::None => (self.base_millis(attempt), 0.0),
            Jitter::Full => (rng.gen::<f64>() * self.base_millis(attempt), 0.0),
            Jitter::Equal => {
                let half = self.base_millis(attempt) / 2.0;
                (half + rng.gen::<f64>() * half, 0.0)
            }
            Jitter::Decorrelated => {
                let t = f64::from(attempt) + rng.gen::<f64>();
                let next = self.exponent.powf(t) * (DECORRELATED_P_FACTOR * t).sqrt().tanh();
                let max = self.max_delay.as_secs_f64() * 1000.0;
                let initial = self.initial_delay.as_secs_f64() * 1000.0;
                // Past f64 range the curve has long outgrown the cap.
                if !next.is_finite() {
                    return (max, previous);
                }
                let delay = ((next - previous) * DECORRELATED_RP_SCALING * initial).clamp(0.0, max);
                (delay, next)
            }
        }
    }

    fn step(self: &Arc<Self>, attempt: u32, previous: f64) -> Option<ExponentialStep> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let (millis, state) = self.delay(attempt, previous);
        Some(ExponentialStep {
            options: Arc::clone(self),
            attempt,
            state,
            duration: to_duration(millis),
        })
    }
}

fn to_duration(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 {
        Duration::from_micros((millis * 1000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug)]
struct ExponentialStep {
    options: Arc<ExponentialBackoff>,
    attempt: u32,
    // Raw decorrelated value the next delay is keyed on.
    state: f64,
    duration: Duration,
}

impl<C> BackoffStep<C> for ExponentialStep {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = self.options.step(self.attempt.saturating_add(1), self.state)?;
        Some(Box::new(step))
    }
}

impl<C> BackoffFactory<C> for ExponentialBackoff {
    fn next(&self, _context: &C) -> Option<Box<dyn BackoffStep<C>>> {
        let step = Arc::new(self.clone()).step(0, 0.0)?;
        Some(Box::new(step))
    }
}
