//! Serializable policy configuration
//!
//! Every policy can be described by plain data, loaded from TOML or JSON and
//! turned into runtime objects with `build()` or the policies' `from_config`
//! constructors. Durations are written as integer milliseconds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{
    BackoffFactory, ConstantBackoff, Exhaustion, ExponentialBackoff, IterableBackoff, Jitter,
};
use crate::breaker::{BreakerStrategy, ConsecutiveBreaker, CountBreaker, SamplingBreaker};
use crate::error::{ConfigError, ConfigResult};

/// Serialize a `Duration` as whole milliseconds
///
/// ```rust
/// use std::time::Duration;
///
/// use keelson_policy::config::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Write a duration as whole milliseconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Read a duration from milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(128)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_exponent() -> f64 {
    2.0
}

/// A backoff generator described as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay every time, optionally for a limited number of steps
    Constant {
        #[serde(rename = "delay_ms", with = "duration_millis")]
        delay: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    /// Exponentially growing delays
    Exponential {
        #[serde(
            rename = "initial_delay_ms",
            with = "duration_millis",
            default = "default_initial_delay"
        )]
        initial_delay: Duration,
        #[serde(rename = "max_delay_ms", with = "duration_millis", default = "default_max_delay")]
        max_delay: Duration,
        #[serde(default = "default_exponent")]
        exponent: f64,
        #[serde(default)]
        jitter: Jitter,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
    },
    /// A fixed list of delays
    Iterable {
        delays_ms: Vec<u64>,
        #[serde(default)]
        repeat_last: bool,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponent: default_exponent(),
            jitter: Jitter::default(),
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Check the options without building
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Constant { .. } => Ok(()),
            Self::Exponential { .. } => self.exponential().map(drop),
            Self::Iterable { delays_ms, .. } if delays_ms.is_empty() => {
                Err(ConfigError::invalid("iterable backoff needs at least one delay"))
            }
            Self::Iterable { .. } => Ok(()),
        }
    }

    /// Build the generator for a policy whose backoff context is `C`
    pub fn build<C: 'static>(&self) -> ConfigResult<Arc<dyn BackoffFactory<C>>> {
        self.validate()?;
        let factory: Arc<dyn BackoffFactory<C>> = match self {
            Self::Constant { delay, limit } => {
                let backoff = ConstantBackoff::new(*delay);
                match limit {
                    Some(limit) => Arc::new(backoff.with_limit(*limit)),
                    None => Arc::new(backoff),
                }
            }
            Self::Exponential { .. } => Arc::new(self.exponential()?),
            Self::Iterable { delays_ms, repeat_last } => {
                let exhaustion = if *repeat_last { Exhaustion::RepeatLast } else { Exhaustion::Stop };
                Arc::new(
                    IterableBackoff::new(delays_ms.iter().copied().map(Duration::from_millis))
                        .with_exhaustion(exhaustion),
                )
            }
        };
        Ok(factory)
    }

    fn exponential(&self) -> ConfigResult<ExponentialBackoff> {
        let Self::Exponential { initial_delay, max_delay, exponent, jitter, max_attempts } = self
        else {
            return Err(ConfigError::invalid("not an exponential backoff"));
        };

        let mut backoff = ExponentialBackoff::new()
            .with_initial_delay(*initial_delay)
            .with_max_delay(*max_delay)
            .with_exponent(*exponent)
            .with_jitter(*jitter);
        if let Some(attempts) = max_attempts {
            backoff = backoff.with_max_attempts(*attempts);
        }
        backoff.validate()?;
        Ok(backoff)
    }
}

/// A breaker strategy described as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Consecutive {
        threshold: u32,
    },
    Count {
        threshold: f64,
        size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_calls: Option<usize>,
    },
    Sampling {
        threshold: f64,
        #[serde(rename = "duration_ms", with = "duration_millis")]
        duration: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_rps: Option<f64>,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Consecutive { threshold: 5 }
    }
}

impl StrategyConfig {
    /// Check the options without building
    pub fn validate(&self) -> ConfigResult<()> {
        self.build().map(drop)
    }

    /// Build the configured strategy
    pub fn build(&self) -> ConfigResult<Box<dyn BreakerStrategy>> {
        Ok(match *self {
            Self::Consecutive { threshold } => Box::new(ConsecutiveBreaker::new(threshold)?),
            Self::Count { threshold, size, minimum_calls } => Box::new(match minimum_calls {
                Some(minimum) => CountBreaker::with_minimum_calls(threshold, size, minimum)?,
                None => CountBreaker::new(threshold, size)?,
            }),
            Self::Sampling { threshold, duration, minimum_rps } => Box::new(match minimum_rps {
                Some(rps) => SamplingBreaker::with_minimum_rps(threshold, duration, rps)?,
                None => SamplingBreaker::new(threshold, duration)?,
            }),
        })
    }
}

/// Retry policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS, backoff: BackoffConfig::default() }
    }
}

impl RetryConfig {
    /// Check the backoff options
    pub fn validate(&self) -> ConfigResult<()> {
        self.backoff.validate()
    }
}

/// Circuit breaker settings
///
/// `half_open_backoff`, when present, replaces the constant
/// `half_open_after` delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Constant delay before a probe is let through
    #[serde(rename = "half_open_after_ms", with = "duration_millis")]
    pub half_open_after: Duration,
    /// Delay schedule across consecutive reopenings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_backoff: Option<BackoffConfig>,
    /// When the circuit opens
    pub strategy: StrategyConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            half_open_after: crate::circuit_breaker::DEFAULT_HALF_OPEN_AFTER,
            half_open_backoff: None,
            strategy: StrategyConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Check the strategy and reopen backoff
    pub fn validate(&self) -> ConfigResult<()> {
        self.strategy.validate()?;
        if let Some(backoff) = &self.half_open_backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}

/// Bulkhead limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Operations allowed to run at once
    pub capacity: usize,
    /// Callers allowed to wait for a slot
    pub queue_capacity: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { capacity: 10, queue_capacity: 10 }
    }
}

impl BulkheadConfig {
    /// Check the limits
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::out_of_range("capacity", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::test_support::{durations, millis};

    /// Validates that omitted fields fall back to the documented defaults.
    ///
    /// Assertions:
    /// - Confirms an empty JSON object yields every default.
    #[test]
    fn test_defaults_from_empty_input() -> anyhow::Result<()> {
        let retry: RetryConfig = serde_json::from_str("{}")?;
        assert_eq!(retry, RetryConfig::default());
        assert_eq!(retry.max_attempts, 3);

        let breaker: CircuitBreakerConfig = serde_json::from_str("{}")?;
        assert_eq!(breaker.half_open_after, Duration::from_secs(60));
        assert_eq!(breaker.strategy, StrategyConfig::Consecutive { threshold: 5 });

        let bulkhead: BulkheadConfig = serde_json::from_str("{}")?;
        assert_eq!(bulkhead, BulkheadConfig { capacity: 10, queue_capacity: 10 });
        Ok(())
    }

    #[test]
    fn test_backoff_kinds_parse() -> anyhow::Result<()> {
        let constant: BackoffConfig =
            serde_json::from_str(r#"{"kind":"constant","delay_ms":250,"limit":2}"#)?;
        assert_eq!(
            constant,
            BackoffConfig::Constant { delay: Duration::from_millis(250), limit: Some(2) }
        );
        let factory = constant.build::<()>()?;
        assert_eq!(durations(&*factory, &(), 10), millis(&[250, 250]));

        let iterable: BackoffConfig =
            serde_json::from_str(r#"{"kind":"iterable","delays_ms":[10,20],"repeat_last":true}"#)?;
        let factory = iterable.build::<()>()?;
        assert_eq!(durations(&*factory, &(), 4), millis(&[10, 20, 20, 20]));

        let exponential: BackoffConfig = serde_json::from_str(
            r#"{"kind":"exponential","initial_delay_ms":10,"jitter":"none","max_attempts":3}"#,
        )?;
        let factory = exponential.build::<()>()?;
        assert_eq!(durations(&*factory, &(), 10), millis(&[10, 20, 40]));
        Ok(())
    }

    /// Validates configuration errors surface before anything is built.
    ///
    /// Assertions:
    /// - Confirms bad exponents, empty delay lists and zero capacity fail.
    /// - Confirms strategy ranges are checked through the constructors.
    #[test]
    fn test_validation_errors() {
        let exponential = BackoffConfig::Exponential {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            exponent: 0.5,
            jitter: Jitter::None,
            max_attempts: None,
        };
        assert!(matches!(
            exponential.validate(),
            Err(ConfigError::OutOfRange { field: "exponent", .. })
        ));

        let empty = BackoffConfig::Iterable { delays_ms: Vec::new(), repeat_last: false };
        assert!(matches!(empty.validate(), Err(ConfigError::Invalid { .. })));

        let bulkhead = BulkheadConfig { capacity: 0, queue_capacity: 5 };
        assert!(matches!(
            bulkhead.validate(),
            Err(ConfigError::OutOfRange { field: "capacity", .. })
        ));

        let breaker = CircuitBreakerConfig {
            strategy: StrategyConfig::Count { threshold: 0.5, size: 4, minimum_calls: Some(8) },
            ..CircuitBreakerConfig::default()
        };
        assert!(matches!(
            breaker.validate(),
            Err(ConfigError::OutOfRange { field: "minimum_calls", .. })
        ));
    }

    #[test]
    fn test_strategy_serializes_with_kind_tag() -> anyhow::Result<()> {
        let sampling = StrategyConfig::Sampling {
            threshold: 0.25,
            duration: Duration::from_secs(10),
            minimum_rps: None,
        };
        let json = serde_json::to_value(&sampling)?;
        assert_eq!(
            json,
            serde_json::json!({"kind": "sampling", "threshold": 0.25, "duration_ms": 10_000})
        );
        assert!(sampling.build().is_ok());
        Ok(())
    }
}
