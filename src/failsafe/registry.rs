//! Circuit breaker registry keyed by dependency name

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Lazily-populated map of dependency name to circuit breaker.
///
/// Each breaker carries its own lock; the map only locks a shard while an
/// entry is looked up or inserted.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    /// Breakers by name
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    /// Fallback configuration for names with no override or preset
    defaults: CircuitBreakerConfig,
    /// Explicit per-name configuration
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given default configuration
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Create a registry with per-dependency overrides
    #[must_use]
    pub fn with_overrides(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides,
        }
    }

    /// Configuration a breaker named `name` would be created with:
    /// explicit override, then name-derived preset, then the default.
    #[must_use]
    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        if let Some(config) = self.overrides.get(name) {
            return config.clone();
        }
        CircuitBreakerConfig::for_dependency(name).map_or_else(
            || self.defaults.clone(),
            |preset| CircuitBreakerConfig {
                enabled: self.defaults.enabled,
                ..preset
            },
        )
    }

    /// Get the breaker for `name`, creating it on first reference
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(&existing);
        }
        let config = self.config_for(name);
        self.get_or_create_with(name, &config)
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    ///
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create_with(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(
                service = %name,
                failure_threshold = config.failure_threshold,
                success_threshold = config.success_threshold,
                reset_timeout_ms = config.reset_timeout.as_millis(),
                "Created circuit breaker"
            );
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(&entry)
    }

    /// Get an existing breaker
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&*b))
    }

    /// Run `operation` through the breaker for `name`
    pub async fn execute<F, Fut, T>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_create(name).execute(operation).await
    }

    /// Run `operation` through the breaker for `name`, creating it with
    /// `config` on first reference
    pub async fn execute_with_config<F, Fut, T>(
        &self,
        name: &str,
        config: &CircuitBreakerConfig,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_create_with(name, config).execute(operation).await
    }

    /// Force a named breaker closed
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no breaker with that name exists.
    pub fn force_reset(&self, name: &str) -> Result<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("circuit breaker '{name}'")))?;
        breaker.force_reset();
        Ok(())
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.force_reset();
        }
        info!(count = self.breakers.len(), "All circuit breakers reset");
    }

    /// Registered dependency names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of every breaker, keyed by name
    #[must_use]
    pub fn stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.stats()))
            .collect()
    }

    /// Names of breakers currently open
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lazy_creation_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("database");
        let b = registry.get_or_create("database");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.names(), vec!["database".to_string()]);
    }

    #[test]
    fn test_name_derived_configuration() {
        let registry = CircuitBreakerRegistry::default();
        assert_eq!(
            registry.get_or_create("redis").config(),
            &CircuitBreakerConfig::cache()
        );
        assert_eq!(
            registry.get_or_create("ledger").config(),
            &CircuitBreakerConfig::default()
        );
    }

    #[test]
    fn test_override_beats_preset() {
        let custom = CircuitBreakerConfig {
            failure_threshold: 9,
            ..CircuitBreakerConfig::default()
        };
        let registry = CircuitBreakerRegistry::with_overrides(
            CircuitBreakerConfig::default(),
            HashMap::from([("redis".to_string(), custom.clone())]),
        );
        assert_eq!(registry.get_or_create("redis").config(), &custom);
    }

    #[test]
    fn test_config_ignored_for_existing_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get_or_create("search");
        let other = CircuitBreakerConfig {
            reset_timeout: Duration::from_secs(1),
            ..CircuitBreakerConfig::default()
        };
        let second = registry.get_or_create_with("search", &other);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().reset_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_execute_with_config_creates_breaker_from_config() {
        let registry = CircuitBreakerRegistry::default();
        let strict = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let err = registry
            .execute_with_config("ledger", &strict, || async {
                Err::<(), _>(Error::connection("down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(registry.get("ledger").unwrap().config(), &strict);
        assert_eq!(registry.open_circuits(), vec!["ledger".to_string()]);

        let err = registry
            .execute_with_config("ledger", &strict, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_force_reset_unknown_name() {
        let registry = CircuitBreakerRegistry::default();
        assert!(matches!(registry.force_reset("nope"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_independent_breakers() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..3 {
            let _ = registry
                .execute("redis", || async { Err::<(), _>(Error::connection("down")) })
                .await;
        }
        assert_eq!(registry.open_circuits(), vec!["redis".to_string()]);
        registry
            .execute("database", || async { Ok(()) })
            .await
            .unwrap();

        registry.reset_all();
        assert!(registry.open_circuits().is_empty());
    }
}
