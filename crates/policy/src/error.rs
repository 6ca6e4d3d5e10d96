//! Error types shared by every policy

use thiserror::Error;

/// Configuration error raised synchronously by constructors and builders
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The configuration is inconsistent or cannot be applied
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// A numeric argument is outside its permitted range
    #[error("{field} out of range: {message}")]
    OutOfRange { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }

    pub(crate) fn out_of_range(field: &'static str, message: impl Into<String>) -> Self {
        Self::OutOfRange { field, message: message.into() }
    }
}

/// Errors surfaced by policy execution
///
/// Generic over the operation's own error type `E`. A failure produced by the
/// operation is carried verbatim in [`ResilienceError::OperationFailed`];
/// every other variant is raised by a policy without the operation having
/// been invoked (or, for cancellation, without waiting for it).
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, rejecting calls")]
    BrokenCircuit,

    /// Circuit breaker was isolated manually, rejecting calls
    #[error("Circuit breaker is isolated, rejecting calls")]
    IsolatedCircuit,

    /// Bulkhead execution slots and queue are both full
    #[error("Bulkhead capacity exceeded: {capacity} executions, {queue_capacity} queued")]
    BulkheadRejected { capacity: usize, queue_capacity: usize },

    /// Cancellation was observed while waiting
    #[error("Operation was cancelled")]
    TaskCancelled,

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// True for both open-circuit and isolated-circuit rejections
    pub fn is_broken_circuit(&self) -> bool {
        matches!(self, Self::BrokenCircuit | Self::IsolatedCircuit)
    }

    /// True for a manually isolated circuit
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::IsolatedCircuit)
    }

    /// True when the bulkhead turned the call away
    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. })
    }

    /// True when the caller's token was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::TaskCancelled)
    }

    /// Borrow the operation's error, if this is an operation failure
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }

    /// Take the operation's error, if this is an operation failure
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for policy execution
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("downstream unavailable")]
    struct Downstream;

    /// Validates the broken-circuit classification helpers.
    ///
    /// Assertions:
    /// - Ensures isolation counts as a broken circuit.
    /// - Ensures operation failures do not.
    #[test]
    fn test_broken_circuit_covers_isolation() {
        assert!(ResilienceError::<Downstream>::BrokenCircuit.is_broken_circuit());
        assert!(ResilienceError::<Downstream>::IsolatedCircuit.is_broken_circuit());
        assert!(ResilienceError::<Downstream>::IsolatedCircuit.is_isolated());
        assert!(!ResilienceError::OperationFailed { source: Downstream }.is_broken_circuit());
    }

    #[test]
    fn test_operation_error_is_preserved() {
        let err = ResilienceError::OperationFailed { source: Downstream };
        assert_eq!(err.operation_error(), Some(&Downstream));
        assert_eq!(
            std::error::Error::source(&err).map(ToString::to_string),
            Some("downstream unavailable".to_string())
        );
        assert_eq!(err.into_source(), Some(Downstream));
    }

    #[test]
    fn test_bulkhead_rejection_message_carries_limits() {
        let err = ResilienceError::<Downstream>::BulkheadRejected { capacity: 2, queue_capacity: 3 };
        assert!(err.is_bulkhead_rejected());
        assert_eq!(err.to_string(), "Bulkhead capacity exceeded: 2 executions, 3 queued");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::out_of_range("threshold", "must be in (0, 1), got 1.5");
        assert_eq!(err.to_string(), "threshold out of range: must be in (0, 1), got 1.5");
        assert_eq!(ConfigError::invalid("bad").to_string(), "Invalid configuration: bad");
    }
}
