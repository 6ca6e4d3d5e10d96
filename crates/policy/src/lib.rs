//! Resilience policies for unreliable async operations.
//!
//! Three policies share one outcome model:
//! - [`RetryPolicy`] re-runs a failed operation on a backoff schedule.
//! - [`CircuitBreaker`] stops calling a failing dependency, then probes it
//!   with a single call before letting traffic through again.
//! - [`Bulkhead`] caps how many operations run at once and queues the rest.
//!
//! A [`Classifier`] decides which errors and returned values count as
//! failures. Errors it does not handle pass through every policy untouched.
//! Delays come from the generators in [`backoff`], and breaker decisions from
//! the strategies in [`breaker`]. Each policy can also be built from the
//! serializable types in [`config`].
//!
//! # Example
//!
//! ```rust
//! use keelson_policy::backoff::ConstantBackoff;
//! use keelson_policy::{Classifier, RetryPolicy};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .classifier(Classifier::<u32, std::io::Error>::handle_all())
//!     .max_attempts(2)
//!     .backoff(ConstantBackoff::new(Duration::from_millis(1)))
//!     .build();
//!
//! let value = policy.execute(|_| async { Ok(7) }).await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod backoff;
pub mod breaker;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod outcome;
pub mod retry;

pub use breaker::{
    BreakerStrategy, CircuitState, ConsecutiveBreaker, CountBreaker, SamplingBreaker,
    StrategySnapshot,
};
pub use bulkhead::{Bulkhead, BulkheadFailureEvent, BulkheadRejectedEvent};
pub use circuit_breaker::{
    BreakEvent, CircuitBreaker, CircuitBreakerBuilder, HalfOpenBackoffContext, IsolationHandle,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{BackoffConfig, BulkheadConfig, CircuitBreakerConfig, RetryConfig, StrategyConfig};
pub use error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
pub use events::{ListenerHandle, Listeners, SuccessEvent};
pub use outcome::{Classifier, FailureEvent, FailureReason, Outcome};
pub use retry::{
    GiveUpEvent, RetryBackoffContext, RetryContext, RetryEvent, RetryPolicy, RetryPolicyBuilder,
};
pub use tokio_util::sync::CancellationToken;
