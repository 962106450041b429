//! Default transient-error classifier

use crate::ResilienceError;
use once_cell::sync::Lazy;
use pantheon_core::TaskError;
use regex::Regex;

/// Transport error codes worth retrying.
const RETRYABLE_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ENOTFOUND",
    "ECONNREFUSED",
    "EPIPE",
    "ENETUNREACH",
];

static TRANSIENT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timeout|timed out|temporary|unavailable|rate.?limit|too many requests|connection reset")
        .expect("transient pattern is a valid regex")
});

/// Returns true when the error looks transient and is worth retrying.
///
/// Timeouts are transient; an open circuit is not (retrying only burns
/// attempts against a breaker that will keep rejecting).
pub fn is_transient(error: &ResilienceError) -> bool {
    match error.root() {
        ResilienceError::Timeout { .. } => true,
        ResilienceError::CircuitOpen { .. } => false,
        ResilienceError::Operation(task) => is_transient_task_error(task),
        _ => false,
    }
}

pub fn is_transient_task_error(error: &TaskError) -> bool {
    if let Some(code) = &error.code {
        if RETRYABLE_CODES.contains(&code.as_str()) {
            return true;
        }
    }

    if let Some(status) = error.status {
        return status >= 500 || status == 408 || status == 429;
    }

    TRANSIENT_MESSAGE.is_match(&error.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_codes() {
        let err = TaskError::new("socket closed").with_code("ECONNRESET");
        assert!(is_transient_task_error(&err));

        let err = TaskError::new("bad input").with_code("EINVAL");
        assert!(!is_transient_task_error(&err));
    }

    #[test]
    fn test_status_codes() {
        assert!(is_transient_task_error(&TaskError::new("x").with_status(503)));
        assert!(is_transient_task_error(&TaskError::new("x").with_status(429)));
        assert!(is_transient_task_error(&TaskError::new("x").with_status(408)));
        assert!(!is_transient_task_error(&TaskError::new("x").with_status(404)));
        // Status decides even when the message looks transient
        assert!(!is_transient_task_error(&TaskError::new("timeout").with_status(400)));
    }

    #[test]
    fn test_message_patterns() {
        assert!(is_transient_task_error(&TaskError::new("Request Timeout")));
        assert!(is_transient_task_error(&TaskError::new("service temporarily unavailable")));
        assert!(is_transient_task_error(&TaskError::new("rate limit exceeded")));
        assert!(is_transient_task_error(&TaskError::new("rate_limit hit")));
        assert!(is_transient_task_error(&TaskError::new("connection reset by peer")));
        assert!(!is_transient_task_error(&TaskError::new("invalid argument")));
    }

    #[test]
    fn test_resilience_variants() {
        assert!(is_transient(&ResilienceError::Timeout {
            after: Duration::from_secs(1)
        }));
        assert!(!is_transient(&ResilienceError::CircuitOpen {
            name: "x".to_string()
        }));
    }
}
