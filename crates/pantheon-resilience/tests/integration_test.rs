//! Integration tests for the pantheon-resilience crate.

use pantheon_core::{event_types, BreakerSettings, MemorySink, TaskError};
use pantheon_resilience::{
    BackoffStrategy, CircuitBreakerRegistry, CircuitState, ResilienceError, RetryConfig,
    RetryPolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn settings() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 2,
        success_threshold: 1,
        timeout_ms: 1_000,
        reset_timeout_ms: 500,
    }
}

// ==================== Retry + Breaker ====================

#[tokio::test(start_paused = true)]
async fn test_retry_stops_once_breaker_opens() {
    let registry = CircuitBreakerRegistry::new(settings());
    let breaker = registry.get("flaky-service");
    let retry = RetryPolicy::new(
        RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_strategy(BackoffStrategy::Fixed)
            .with_jitter(false),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = retry
        .execute(|_| {
            let breaker = breaker.clone();
            let calls = calls.clone();
            async move {
                breaker
                    .execute(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TaskError::new("upstream unavailable").with_status(503))
                    })
                    .await
            }
        })
        .await;

    // Two real failures open the breaker; the rejection is not retried
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!registry.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_half_open() {
    let sink = MemorySink::new();
    let registry = CircuitBreakerRegistry::with_events(settings(), Arc::new(sink.clone()));
    let breaker = registry.get("search");

    for _ in 0..2 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(TaskError::new("boom")) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(600)).await;

    let value = breaker
        .execute(|| async { Ok::<_, TaskError>("recovered") })
        .await
        .unwrap();

    assert_eq!(value, "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(sink.count(event_types::BREAKER_OPENED), 1);
    assert_eq!(sink.count(event_types::BREAKER_HALF_OPENED), 1);
    assert_eq!(sink.count(event_types::BREAKER_CLOSED), 1);

    let status = &registry.statuses()["search"];
    assert_eq!(status.metrics.state_changes.len(), 3);
    assert_eq!(status.metrics.total_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_transient_status() {
    let retry = RetryPolicy::new(
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false),
    );

    let result = retry
        .execute(|attempt| async move {
            if attempt == 1 {
                Err(TaskError::new("slow down").with_status(429))
            } else {
                Ok(attempt)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 2);
}
