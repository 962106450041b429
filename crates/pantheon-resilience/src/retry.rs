//! Retry policies
//!
//! Provides configurable retry strategies with exponential, linear,
//! fibonacci or fixed backoff.

use crate::classify::is_transient;
use crate::{ResilienceError, Result};
use pantheon_core::{event_types, Event, NoopSink, RetrySettings, SharedSink};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Jitter perturbs a delay by up to this fraction in either direction
const JITTER_FACTOR: f64 = 0.25;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial_delay * multiplier^(attempt - 1)`
    #[default]
    Exponential,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay` scaled along 1, 2, 3, 5, 8, ...
    Fibonacci,
    /// Always `initial_delay`
    Fixed,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fibonacci" => Ok(BackoffStrategy::Fibonacci),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!("unknown backoff strategy: {}", other)),
        }
    }
}

/// Decides whether a failed attempt should be retried
pub type RetryCondition = Arc<dyn Fn(&ResilienceError, u32) -> bool + Send + Sync>;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    pub strategy: BackoffStrategy,
    /// Whether to add random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        let strategy = settings.strategy.parse().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to exponential backoff");
            BackoffStrategy::Exponential
        });

        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            strategy,
            jitter: settings.jitter,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a config with no retries (for non-idempotent operations)
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Counters accumulated across calls to one policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetrics {
    /// Every invocation of the operation
    pub total_attempts: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Sleeps taken before a retry
    pub total_retries: u64,
    /// Mean retries needed by successful calls
    pub average_retries: f64,
}

/// Retry policy implementation
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    condition: RetryCondition,
    metrics: Arc<Mutex<RetryMetrics>>,
    events: SharedSink,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a new retry policy using the default transient-error classifier
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            condition: Arc::new(|error: &ResilienceError, _attempt: u32| is_transient(error)),
            metrics: Arc::new(Mutex::new(RetryMetrics::default())),
            events: NoopSink::shared(),
        }
    }

    /// Create with fixed delay (no backoff, no jitter)
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(delay)
                .with_max_delay(delay)
                .with_strategy(BackoffStrategy::Fixed)
                .with_jitter(false),
        )
    }

    /// Create with exponential backoff
    pub fn exponential(max_retries: u32) -> Self {
        Self::new(RetryConfig::new(max_retries))
    }

    /// Replace the retry-eligibility predicate
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ResilienceError, u32) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.metrics.lock().clone()
    }

    pub(crate) fn tuned(mut self, multiplier: f64, max_retries: u32) -> Self {
        self.config.multiplier = multiplier;
        self.config.max_retries = max_retries;
        self
    }

    /// Base delay after the given failed attempt (1-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial = self.config.initial_delay;
        let max = self.config.max_delay;
        let delay = match self.config.strategy {
            BackoffStrategy::Exponential => {
                let secs = initial.as_secs_f64() * self.config.multiplier.powi((attempt - 1) as i32);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
            BackoffStrategy::Linear => initial.saturating_mul(attempt),
            BackoffStrategy::Fibonacci => initial.saturating_mul(fibonacci(attempt + 1)),
            BackoffStrategy::Fixed => initial,
        };

        delay.min(max)
    }

    /// Delay actually slept after the given failed attempt
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.config.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }

    /// Check if a failure at `attempt` should be retried
    pub fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool {
        attempt <= self.config.max_retries && (self.condition)(error, attempt)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts.
    ///
    /// The operation receives the 1-based attempt number. Exhaustion surfaces
    /// the last error wrapped in [`ResilienceError::RetryExhausted`].
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.lock().total_attempts += 1;

            let error: ResilienceError = match operation(attempt).await {
                Ok(value) => {
                    self.record_success(attempt - 1);
                    if attempt > 1 {
                        self.events.emit(Event::new(
                            event_types::RETRY_SUCCEEDED,
                            serde_json::json!({
                                "attempt": attempt,
                                "retries": attempt - 1,
                                "duration_ms": started.elapsed().as_millis() as u64,
                            }),
                        ));
                    }
                    return Ok(value);
                }
                Err(e) => e.into(),
            };

            if !(self.condition)(&error, attempt) {
                self.metrics.lock().failed_calls += 1;
                debug!(attempt, error = %error, "Non-retryable error, aborting");
                self.events.emit(Event::new(
                    event_types::RETRY_ABORTED,
                    serde_json::json!({
                        "attempt": attempt,
                        "error": error.to_string(),
                        "reason": "non-retryable error",
                    }),
                ));
                return Err(error);
            }

            if attempt > self.config.max_retries {
                self.metrics.lock().failed_calls += 1;
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                self.events.emit(Event::new(
                    event_types::RETRY_EXHAUSTED,
                    serde_json::json!({
                        "attempts": attempt,
                        "error": error.to_string(),
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                ));
                return Err(ResilienceError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.next_delay(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            self.events.emit(Event::new(
                event_types::RETRY_ATTEMPT,
                serde_json::json!({
                    "attempt": attempt + 1,
                    "delay_ms": delay.as_millis() as u64,
                    "error": error.to_string(),
                    "retries_remaining": self.config.max_retries - attempt + 1,
                }),
            ));

            tokio::time::sleep(delay).await;
            self.metrics.lock().total_retries += 1;
        }
    }

    fn record_success(&self, retries: u32) {
        let mut metrics = self.metrics.lock();
        metrics.successful_calls += 1;
        let n = metrics.successful_calls as f64;
        metrics.average_retries = (metrics.average_retries * (n - 1.0) + retries as f64) / n;
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

fn add_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
    delay.mul_f64(1.0 + factor)
}
