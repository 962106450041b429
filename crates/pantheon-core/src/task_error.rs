//! Error reported by an opaque unit of work (a worker, task or operation).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by an opaque unit of work.
///
/// Workers are free to attach a transport-level `code` (e.g. `ECONNRESET`) or
/// an HTTP-like `status`; both feed the transient-error classifier used by
/// retry policies.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskError {
    /// Human readable failure message
    pub message: String,
    /// Transport error code, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// HTTP-like status code, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_builder() {
        let err = TaskError::new("upstream unavailable")
            .with_code("ECONNRESET")
            .with_status(503);

        assert_eq!(err.to_string(), "upstream unavailable");
        assert_eq!(err.code.as_deref(), Some("ECONNRESET"));
        assert_eq!(err.status, Some(503));
    }
}
