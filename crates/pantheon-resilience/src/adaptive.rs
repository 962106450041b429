//! Self-tuning retry policy.

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::{ResilienceError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

const SUCCESS_STREAK: u32 = 5;
const FAILURE_STREAK: u32 = 3;
const MIN_MULTIPLIER: f64 = 1.5;
const MAX_MULTIPLIER: f64 = 3.0;
const MIN_RETRIES: u32 = 2;
const MAX_RETRIES: u32 = 5;

#[derive(Debug)]
struct Tuning {
    multiplier: f64,
    max_retries: u32,
    success_streak: u32,
    failure_streak: u32,
}

/// Retry policy that adjusts its multiplier and retry budget from the
/// outcomes of separate calls.
///
/// After 5 consecutive successful calls the multiplier shrinks by 10% (not
/// below 1.5) and one retry is dropped (not below 2). After 3 consecutive
/// failed calls the multiplier grows by 10% (not above 3) and one retry is
/// added (not above 5).
#[derive(Clone)]
pub struct AdaptiveRetryPolicy {
    base: RetryPolicy,
    tuning: Arc<Mutex<Tuning>>,
    breaker: Option<CircuitBreaker>,
}

impl AdaptiveRetryPolicy {
    pub fn new(base: RetryPolicy) -> Self {
        let config = base.config();
        let tuning = Tuning {
            multiplier: config.multiplier,
            max_retries: config.max_retries,
            success_streak: 0,
            failure_streak: 0,
        };

        Self {
            base,
            tuning: Arc::new(Mutex::new(tuning)),
            breaker: None,
        }
    }

    /// Refuse to start while `breaker` is not CLOSED
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn multiplier(&self) -> f64 {
        self.tuning.lock().multiplier
    }

    pub fn max_retries(&self) -> u32 {
        self.tuning.lock().max_retries
    }

    /// The retry configuration the next call will use
    pub fn current_config(&self) -> RetryConfig {
        let tuning = self.tuning.lock();
        let mut config = self.base.config().clone();
        config.multiplier = tuning.multiplier;
        config.max_retries = tuning.max_retries;
        config
    }

    /// Run `operation` with the current tuning, then adapt to the outcome.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
    {
        if let Some(breaker) = &self.breaker {
            if !breaker.is_healthy() {
                return Err(ResilienceError::CircuitOpen {
                    name: breaker.name().to_string(),
                });
            }
        }

        let policy = self.snapshot();
        let result = policy.execute(operation).await;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result
    }

    fn snapshot(&self) -> RetryPolicy {
        let tuning = self.tuning.lock();
        self.base.clone().tuned(tuning.multiplier, tuning.max_retries)
    }

    fn record_success(&self) {
        let mut tuning = self.tuning.lock();
        tuning.success_streak += 1;
        tuning.failure_streak = 0;

        if tuning.success_streak >= SUCCESS_STREAK {
            tuning.multiplier = (tuning.multiplier * 0.9).max(MIN_MULTIPLIER);
            if tuning.max_retries > MIN_RETRIES {
                tuning.max_retries -= 1;
            }
            debug!(
                multiplier = tuning.multiplier,
                max_retries = tuning.max_retries,
                "Relaxing retry policy after success streak"
            );
        }
    }

    fn record_failure(&self) {
        let mut tuning = self.tuning.lock();
        tuning.failure_streak += 1;
        tuning.success_streak = 0;

        if tuning.failure_streak >= FAILURE_STREAK {
            tuning.multiplier = (tuning.multiplier * 1.1).min(MAX_MULTIPLIER);
            if tuning.max_retries < MAX_RETRIES {
                tuning.max_retries += 1;
            }
            debug!(
                multiplier = tuning.multiplier,
                max_retries = tuning.max_retries,
                "Tightening retry policy after failure streak"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitBreakerConfig;
    use pantheon_core::TaskError;
    use std::time::Duration;

    fn adaptive(max_retries: u32, multiplier: f64) -> AdaptiveRetryPolicy {
        AdaptiveRetryPolicy::new(RetryPolicy::new(
            RetryConfig::new(max_retries)
                .with_multiplier(multiplier)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        ))
    }

    async fn ok(policy: &AdaptiveRetryPolicy) {
        policy
            .execute(|_| async { Ok::<_, TaskError>(()) })
            .await
            .unwrap();
    }

    async fn bad(policy: &AdaptiveRetryPolicy) {
        policy
            .execute(|_| async { Err::<(), _>(TaskError::new("invalid input")) })
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_relaxes_after_success_streak() {
        let policy = adaptive(4, 2.0);

        for _ in 0..4 {
            ok(&policy).await;
        }
        assert_eq!(policy.max_retries(), 4);

        ok(&policy).await;
        assert_eq!(policy.max_retries(), 3);
        assert!((policy.multiplier() - 1.8).abs() < 1e-9);

        for _ in 0..10 {
            ok(&policy).await;
        }
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.multiplier(), 1.5);
    }

    #[tokio::test]
    async fn test_tightens_after_failure_streak() {
        let policy = adaptive(3, 2.0);

        bad(&policy).await;
        bad(&policy).await;
        assert_eq!(policy.max_retries(), 3);

        bad(&policy).await;
        assert_eq!(policy.max_retries(), 4);
        assert!((policy.multiplier() - 2.2).abs() < 1e-9);

        for _ in 0..20 {
            bad(&policy).await;
        }
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.multiplier(), 3.0);
        assert_eq!(policy.current_config().max_retries, 5);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let policy = adaptive(3, 2.0);

        bad(&policy).await;
        bad(&policy).await;
        ok(&policy).await;
        bad(&policy).await;

        assert_eq!(policy.max_retries(), 3);
    }

    #[tokio::test]
    async fn test_refuses_when_breaker_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("upstream"));
        breaker.force_open();
        let policy = adaptive(3, 2.0).with_breaker(breaker);

        let result = policy.execute(|_| async { Ok::<_, TaskError>(()) }).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    }
}
