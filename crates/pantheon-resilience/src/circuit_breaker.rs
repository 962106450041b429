//! Circuit breaker implementation
//!
//! Prevents cascading failures by rejecting calls to an operation that keeps
//! failing, then probing it again after a reset timeout.

use crate::{ResilienceError, Result};
use chrono::{DateTime, Utc};
use pantheon_core::{event_types, BreakerSettings, Event, NoopSink, SharedSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, trial requests probe the operation
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of this circuit breaker (the breaker key)
    pub name: String,
    /// Consecutive failures in CLOSED before opening the circuit
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN needed to close the circuit
    pub success_threshold: u32,
    /// Upper bound on a single operation
    pub timeout: Duration,
    /// Time spent OPEN before the next call may probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config with a name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Build a config for `name` from configured defaults
    pub fn from_settings(name: &str, settings: &BreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set reset timeout
    pub fn with_reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = duration;
        self
    }
}

/// A recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Call counters for a circuit breaker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    pub state_changes: Vec<StateChange>,
}

/// Point-in-time view of a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    /// Time left before an OPEN breaker lets a probe through
    pub next_attempt_in_ms: Option<u64>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub metrics: BreakerMetrics,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    next_attempt_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    metrics: BreakerMetrics,
}

/// Thread-safe circuit breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
    events: SharedSink,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_events(config, NoopSink::shared())
    }

    /// Create a circuit breaker publishing state changes to `events`
    pub fn with_events(config: CircuitBreakerConfig, events: SharedSink) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
                last_failure_at: None,
                metrics: BreakerMetrics::default(),
            })),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// True only while CLOSED
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Run `operation` under breaker protection.
    ///
    /// While OPEN the call is rejected with [`ResilienceError::CircuitOpen`]
    /// without invoking the operation. Exceeding the breaker timeout counts as
    /// a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.acquire()?;

        let outcome = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.inner.lock().metrics.timeouts += 1;
                Err(ResilienceError::Timeout {
                    after: self.config.timeout,
                })
            }
        };

        match &outcome {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(e),
        }

        outcome
    }

    /// Like [`execute`](Self::execute), but a rejection or failure runs
    /// `fallback` and returns its outcome instead.
    ///
    /// Fallback failures surface as [`ResilienceError::FallbackFailed`] and do
    /// not touch breaker state.
    pub async fn execute_with_fallback<F, Fut, T, E, G, GFut, GE>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = std::result::Result<T, GE>>,
        GE: Into<ResilienceError>,
    {
        let error = match self.execute(operation).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        debug!(
            circuit_breaker = %self.config.name,
            error = %error,
            "Executing fallback"
        );
        self.events.emit(Event::new(
            event_types::BREAKER_FALLBACK_EXECUTED,
            serde_json::json!({
                "name": self.config.name,
                "state": self.state(),
                "error": error.to_string(),
            }),
        ));

        match fallback().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let e: ResilienceError = e.into();
                self.events.emit(Event::new(
                    event_types::BREAKER_FALLBACK_FAILED,
                    serde_json::json!({
                        "name": self.config.name,
                        "error": e.to_string(),
                    }),
                ));
                Err(ResilienceError::FallbackFailed {
                    source: Box::new(e),
                })
            }
        }
    }

    /// Admit or reject a call, moving OPEN to HALF_OPEN once the reset timeout elapsed.
    fn acquire(&self) -> Result<()> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;

            if inner.state == CircuitState::Open {
                let ready = inner
                    .next_attempt_at
                    .map_or(true, |at| Instant::now() >= at);

                if ready {
                    self.transition(&mut inner, CircuitState::HalfOpen, &mut pending);
                    Ok(())
                } else {
                    inner.metrics.rejected_calls += 1;
                    debug!(
                        circuit_breaker = %self.config.name,
                        "Request rejected, circuit is open"
                    );
                    pending.push(Event::new(
                        event_types::BREAKER_REJECTED,
                        serde_json::json!({
                            "name": self.config.name,
                            "state": inner.state,
                            "next_attempt_in_ms": remaining_ms(inner.next_attempt_at),
                        }),
                    ));
                    Err(ResilienceError::CircuitOpen {
                        name: self.config.name.clone(),
                    })
                }
            } else {
                Ok(())
            }
        };

        self.publish(pending);
        result
    }

    fn on_success(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.metrics.successful_calls += 1;
            if inner.state == CircuitState::Open {
                // Admitted before the breaker opened; the state stands
                debug!(name = %self.config.name, "Ignoring late success while OPEN");
                return;
            }
            inner.failures = 0;

            if inner.state == CircuitState::HalfOpen {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, &mut pending);
                }
            }

            pending.push(Event::new(
                event_types::BREAKER_SUCCESS,
                serde_json::json!({ "name": self.config.name, "state": inner.state }),
            ));
        }
        self.publish(pending);
    }

    fn on_failure(&self, error: &ResilienceError) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.metrics.failed_calls += 1;
            inner.failures += 1;
            inner.last_failure_at = Some(Utc::now());

            match inner.state {
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, &mut pending);
                }
                CircuitState::Closed => {
                    if inner.failures >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open, &mut pending);
                    }
                }
                CircuitState::Open => {}
            }

            pending.push(Event::new(
                event_types::BREAKER_FAILURE,
                serde_json::json!({
                    "name": self.config.name,
                    "state": inner.state,
                    "failures": inner.failures,
                    "error": error.to_string(),
                }),
            ));
        }
        self.publish(pending);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, pending: &mut Vec<Event>) {
        let from = inner.state;
        inner.state = to;
        inner.metrics.state_changes.push(StateChange {
            from,
            to,
            at: Utc::now(),
        });

        let payload = match to {
            CircuitState::Open => {
                inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                warn!(
                    circuit_breaker = %self.config.name,
                    from = %from,
                    to = "open",
                    failures = inner.failures,
                    "Circuit breaker state transition"
                );
                (
                    event_types::BREAKER_OPENED,
                    serde_json::json!({
                        "name": self.config.name,
                        "failures": inner.failures,
                        "next_attempt_in_ms": self.config.reset_timeout.as_millis() as u64,
                    }),
                )
            }
            CircuitState::HalfOpen => {
                inner.successes = 0;
                inner.failures = 0;
                info!(
                    circuit_breaker = %self.config.name,
                    from = %from,
                    to = "half_open",
                    "Circuit breaker state transition"
                );
                (
                    event_types::BREAKER_HALF_OPENED,
                    serde_json::json!({ "name": self.config.name }),
                )
            }
            CircuitState::Closed => {
                inner.successes = 0;
                inner.failures = 0;
                inner.next_attempt_at = None;
                info!(
                    circuit_breaker = %self.config.name,
                    from = %from,
                    to = "closed",
                    "Circuit breaker state transition"
                );
                (
                    event_types::BREAKER_CLOSED,
                    serde_json::json!({ "name": self.config.name }),
                )
            }
        };

        pending.push(Event::new(payload.0, payload.1));
        pending.push(Event::new(
            event_types::BREAKER_STATE_CHANGED,
            serde_json::json!({ "name": self.config.name, "from": from, "to": to }),
        ));
    }

    fn publish(&self, pending: Vec<Event>) {
        for event in pending {
            self.events.emit(event);
        }
    }

    /// Force the circuit to open (for testing or manual intervention)
    pub fn force_open(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open, &mut pending);
        }
        self.publish(pending);
    }

    /// Force the circuit to close (for testing or manual intervention)
    pub fn force_close(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state != CircuitState::Closed {
                self.transition(&mut inner, CircuitState::Closed, &mut pending);
            }
        }
        self.publish(pending);
    }

    /// Return to CLOSED with cleared counters, keeping metrics
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            inner.successes = 0;
            inner.next_attempt_at = None;
            inner.last_failure_at = None;
        }
        self.events.emit(Event::new(
            event_types::BREAKER_RESET,
            serde_json::json!({ "name": self.config.name }),
        ));
    }

    /// Get circuit breaker status
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.config.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            next_attempt_in_ms: if inner.state == CircuitState::Open {
                remaining_ms(inner.next_attempt_at)
            } else {
                None
            },
            last_failure_at: inner.last_failure_at,
            metrics: inner.metrics.clone(),
        }
    }
}

fn remaining_ms(at: Option<Instant>) -> Option<u64> {
    at.map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantheon_core::{MemorySink, TaskError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new("test")
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(100))
            .with_timeout(Duration::from_secs(5))
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(TaskError::new("boom")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok::<_, TaskError>(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_healthy());
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let cb = CircuitBreaker::new(config());

        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(ResilienceError::Operation(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let result = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(())
                })
                .await;
            assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.status().metrics.rejected_calls, 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(config());

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_while_open_keeps_failures() {
        let cb = CircuitBreaker::new(config());

        let slow = cb.execute(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, TaskError>(1)
        });
        let trip = async {
            for _ in 0..3 {
                fail(&cb).await.unwrap_err();
            }
        };
        let (slow, ()) = tokio::join!(slow, trip);

        assert_eq!(slow.unwrap(), 1);
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 3);
        assert_eq!(status.metrics.successful_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_millis(150)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        // Reset timeout is refreshed
        let result = succeed(&cb).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            config()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(50)),
        );

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, TaskError>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().metrics.timeouts, 1);
    }

    #[tokio::test]
    async fn test_fallback_on_rejection() {
        let cb = CircuitBreaker::new(config());
        cb.force_open();

        let result = cb
            .execute_with_fallback(
                || async { Ok::<_, TaskError>("primary") },
                || async { Ok::<_, TaskError>("fallback") },
            )
            .await;

        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_fallback_failure_does_not_affect_state() {
        let cb = CircuitBreaker::new(config());

        let result = cb
            .execute_with_fallback(
                || async { Err::<(), _>(TaskError::new("primary down")) },
                || async { Err::<(), _>(TaskError::new("fallback down")) },
            )
            .await;

        match result {
            Err(ResilienceError::FallbackFailed { source }) => {
                assert_eq!(source.to_string(), "fallback down");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Only the primary failure was counted
        assert_eq!(cb.status().failures, 1);
        assert_eq!(cb.status().metrics.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_state_change_events() {
        let sink = MemorySink::new();
        let cb = CircuitBreaker::with_events(
            config().with_failure_threshold(1),
            Arc::new(sink.clone()),
        );

        fail(&cb).await.unwrap_err();

        assert_eq!(sink.count(event_types::BREAKER_OPENED), 1);
        assert_eq!(sink.count(event_types::BREAKER_FAILURE), 1);
        let changed = sink.matching(event_types::BREAKER_STATE_CHANGED);
        assert_eq!(changed[0].payload["from"], "closed");
        assert_eq!(changed[0].payload["to"], "open");
    }

    #[tokio::test]
    async fn test_reset_and_status() {
        let cb = CircuitBreaker::new(config());
        cb.force_open();
        assert!(cb.status().next_attempt_in_ms.is_some());

        cb.reset();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failures, 0);
        assert!(status.next_attempt_in_ms.is_none());
        assert_eq!(status.metrics.state_changes.len(), 1);
    }
}
