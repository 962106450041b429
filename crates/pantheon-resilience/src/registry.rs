//! Named circuit breakers, created on first use.

use crate::circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
use dashmap::DashMap;
use pantheon_core::{BreakerSettings, NoopSink, SharedSink};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of circuit breakers keyed by name.
///
/// Breakers are created lazily from the registry defaults; every caller
/// asking for the same key gets a handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    defaults: BreakerSettings,
    events: SharedSink,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerSettings) -> Self {
        Self::with_events(defaults, NoopSink::shared())
    }

    pub fn with_events(defaults: BreakerSettings, events: SharedSink) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            defaults,
            events,
        }
    }

    /// Get the breaker for `name`, creating it from the defaults if needed
    pub fn get(&self, name: &str) -> CircuitBreaker {
        self.get_with(name, |config| config)
    }

    /// Get the breaker for `name`; `customize` only applies when it is created
    pub fn get_with<F>(&self, name: &str, customize: F) -> CircuitBreaker
    where
        F: FnOnce(CircuitBreakerConfig) -> CircuitBreakerConfig,
    {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = customize(CircuitBreakerConfig::from_settings(name, &self.defaults))
                    .with_name(name);
                CircuitBreaker::with_events(config, self.events.clone())
            })
            .clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.breakers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Status of every breaker, ordered by name
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// True when every breaker is CLOSED
    pub fn is_healthy(&self) -> bool {
        self.breakers.iter().all(|entry| entry.value().is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_same_key_shares_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("search");
        let b = registry.get("search");

        a.force_open();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_defaults_and_customization() {
        let registry = CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: 7,
            ..Default::default()
        });

        assert_eq!(registry.get("a").config().failure_threshold, 7);

        let custom = registry.get_with("b", |c| c.with_reset_timeout(Duration::from_secs(1)));
        assert_eq!(custom.config().reset_timeout, Duration::from_secs(1));
        assert_eq!(custom.name(), "b");

        // Customization is ignored once the breaker exists
        let again = registry.get_with("b", |c| c.with_failure_threshold(1));
        assert_eq!(again.config().failure_threshold, 7);
    }

    #[test]
    fn test_health_and_reset_all() {
        let registry = CircuitBreakerRegistry::default();
        registry.get("a");
        registry.get("b").force_open();

        assert!(!registry.is_healthy());
        let statuses = registry.statuses();
        assert_eq!(statuses["b"].state, CircuitState::Open);

        registry.reset_all();
        assert!(registry.is_healthy());
    }
}
