use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("PANTHEON")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("PANTHEON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("scheduler.max_parallel_stages", 3)?
            .set_default("scheduler.total_timeout_ms", 3_600_000)?
            .set_default("scheduler.validation_mode", "strict")?
            .set_default("retry.max_retries", 3)?
            .set_default("retry.initial_delay_ms", 1000)?
            .set_default("retry.max_delay_ms", 30_000)?
            .set_default("retry.multiplier", 2.0)?
            .set_default("retry.strategy", "exponential")?
            .set_default("retry.jitter", true)?
            .set_default("breaker.failure_threshold", 5)?
            .set_default("breaker.success_threshold", 2)?
            .set_default("breaker.timeout_ms", 60_000)?
            .set_default("breaker.reset_timeout_ms", 30_000)?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.json_logs", false)
    }
}

/// How stage results are checked by the external validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Every stage is validated and a rejected result fails the stage
    #[default]
    Strict,
    /// Only stages that ask for validation are checked; rejections are recorded
    Advisory,
}

/// Scheduler defaults applied when a definition leaves a setting out
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    #[serde(default)]
    pub validation_mode: ValidationMode,
}

impl SchedulerConfig {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn with_max_parallel_stages(mut self, max: usize) -> Self {
        self.max_parallel_stages = max;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: default_max_parallel_stages(),
            total_timeout_ms: default_total_timeout_ms(),
            validation_mode: ValidationMode::default(),
        }
    }
}

fn default_max_parallel_stages() -> usize {
    3
}

fn default_total_timeout_ms() -> u64 {
    3_600_000 // 1 hour
}

/// Retry defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// exponential, linear, fibonacci or fixed
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            strategy: default_strategy(),
            jitter: true,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_strategy() -> String {
    "exponential".to_string()
}

fn default_true() -> bool {
    true
}

/// Circuit breaker defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout_ms() -> u64 {
    60_000
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.scheduler.max_parallel_stages, 3);
        assert_eq!(config.scheduler.total_timeout(), Duration::from_secs(3600));
        assert_eq!(config.scheduler.validation_mode, ValidationMode::Strict);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.strategy, "exponential");
        assert!(config.retry.jitter);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_load_from_env_uses_defaults() {
        let config = EngineConfig::load_from_env("PANTHEON_TEST_UNSET").unwrap();

        assert_eq!(config.scheduler.max_parallel_stages, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.breaker.success_threshold, 2);
    }

    #[test]
    fn test_scheduler_builder() {
        let config = SchedulerConfig::default()
            .with_max_parallel_stages(8)
            .with_total_timeout(Duration::from_secs(60))
            .with_validation_mode(ValidationMode::Advisory);

        assert_eq!(config.max_parallel_stages, 8);
        assert_eq!(config.total_timeout_ms, 60_000);
        assert_eq!(config.validation_mode, ValidationMode::Advisory);
    }

    #[test]
    fn test_validation_mode_serde() {
        let mode: ValidationMode = serde_json::from_str("\"advisory\"").unwrap();
        assert_eq!(mode, ValidationMode::Advisory);
    }
}
