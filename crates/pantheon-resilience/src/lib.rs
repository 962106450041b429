//! Resilience patterns for fault-tolerant execution
//!
//! Provides a per-key circuit breaker and backoff-based retry policies for
//! handling transient failures of opaque operations.

pub mod adaptive;
pub mod circuit_breaker;
pub mod classify;
pub mod registry;
pub mod retry;

pub use adaptive::AdaptiveRetryPolicy;
pub use circuit_breaker::{
    BreakerMetrics, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState, StateChange,
};
pub use classify::is_transient;
pub use registry::CircuitBreakerRegistry;
pub use retry::{BackoffStrategy, RetryCondition, RetryConfig, RetryMetrics, RetryPolicy};

use pantheon_core::TaskError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilient operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker rejected the call without attempting it
    #[error("Circuit breaker is OPEN for {name}")]
    CircuitOpen { name: String },

    /// Operation did not finish in time
    #[error("Operation timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// The underlying operation failed
    #[error("{0}")]
    Operation(#[from] TaskError),

    /// All attempts failed; wraps the last error
    #[error("Operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ResilienceError>,
    },

    /// The fallback supplied to a breaker failed
    #[error("Fallback failed: {source}")]
    FallbackFailed {
        #[source]
        source: Box<ResilienceError>,
    },
}

impl ResilienceError {
    /// The innermost error, unwrapping retry exhaustion and fallback layers.
    pub fn root(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetryExhausted { source, .. }
            | ResilienceError::FallbackFailed { source } => source.root(),
            other => other,
        }
    }

    /// The task error at the root, if the failure came from the operation itself.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self.root() {
            ResilienceError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), ResilienceError::CircuitOpen { .. })
    }
}

impl From<&str> for ResilienceError {
    fn from(message: &str) -> Self {
        ResilienceError::Operation(TaskError::new(message))
    }
}

impl From<String> for ResilienceError {
    fn from(message: String) -> Self {
        ResilienceError::Operation(TaskError::new(message))
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_layers() {
        let err = ResilienceError::RetryExhausted {
            attempts: 3,
            source: Box::new(ResilienceError::Operation(TaskError::new("boom"))),
        };

        assert_eq!(err.task_error().map(|e| e.message.as_str()), Some("boom"));
        assert_eq!(err.to_string(), "Operation failed after 3 attempts: boom");
    }

    #[test]
    fn test_circuit_open_display() {
        let err = ResilienceError::CircuitOpen {
            name: "payments".to_string(),
        };
        assert!(err.is_circuit_open());
        assert_eq!(err.to_string(), "Circuit breaker is OPEN for payments");
    }
}
