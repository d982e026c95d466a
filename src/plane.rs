//! Wiring of breakers, retries, degradation and the resource monitor

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::Result;
use crate::config::Config;
use crate::failsafe::{
    CircuitBreakerRegistry, DegradationManager, FallbackStrategies, RetryPolicy, execute_protected,
};
use crate::monitor::{
    CacheEvictor, FeatureFlags, HealthReport, MetricsSource, ResourceMonitor, SystemSampler,
};

/// The resilience control plane for one process
#[derive(Debug)]
pub struct ResiliencePlane {
    config: Config,
    registry: Arc<CircuitBreakerRegistry>,
    degradation: Arc<DegradationManager>,
    strategies: FallbackStrategies,
    retry_policy: RetryPolicy,
    flags: Arc<FeatureFlags>,
    monitor: Arc<ResourceMonitor>,
}

impl ResiliencePlane {
    /// Build from configuration, sampling the host and writing the global flags
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_source(config, Arc::new(SystemSampler::new()), FeatureFlags::global(), None)
    }

    /// Build with an explicit metrics source, flag registry and evictor
    #[must_use]
    pub fn with_source(
        config: Config,
        source: Arc<dyn MetricsSource>,
        flags: Arc<FeatureFlags>,
        evictor: Option<Arc<dyn CacheEvictor>>,
    ) -> Self {
        let registry = Arc::new(CircuitBreakerRegistry::with_overrides(
            config.circuit_breaker.clone(),
            config.circuit_breakers.clone(),
        ));
        let degradation = Arc::new(DegradationManager::new(
            Arc::clone(&registry),
            &config.degradation,
        ));
        let strategies = FallbackStrategies::new(Arc::clone(&degradation), &config.degradation);

        let mut monitor = ResourceMonitor::new(&config.monitor, source, Arc::clone(&flags))
            .with_services(Arc::clone(&degradation));
        if let Some(evictor) = evictor {
            monitor = monitor.with_evictor(evictor);
        }

        Self {
            retry_policy: RetryPolicy::from_config(&config.retry),
            config,
            registry,
            degradation,
            strategies,
            flags,
            monitor: Arc::new(monitor),
        }
    }

    /// Start background monitoring if enabled
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        if self.config.monitor.enabled {
            self.monitor.start(shutdown)
        } else {
            info!("Resource monitor disabled");
            Vec::new()
        }
    }

    /// Run `operation` through the breaker for `service`
    ///
    /// # Errors
    ///
    /// Returns `Error::CircuitOpen` or the operation's error.
    pub async fn execute<F, Fut, T>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.registry.execute(service, operation).await
    }

    /// Run `operation` with the configured retry policy inside the breaker
    /// for `service`
    ///
    /// # Errors
    ///
    /// Returns `Error::CircuitOpen`, `Error::RetriesExhausted` or the
    /// operation's non-retryable error.
    pub async fn execute_with_retry<F, Fut, T>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_protected(&self.registry, service, &self.retry_policy, operation).await
    }

    /// Run `primary` for `service`, substituting `fallback` on failure
    ///
    /// # Errors
    ///
    /// Returns the primary's error if no fallback result was produced.
    pub async fn execute_with_fallback<P, PF, F, FF, T>(
        &self,
        service: &str,
        primary: P,
        fallback: F,
    ) -> Result<T>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
        F: FnOnce() -> FF,
        FF: Future<Output = Result<T>>,
    {
        self.degradation
            .execute_with_fallback(service, primary, fallback)
            .await
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Circuit breaker registry
    #[must_use]
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Degradation manager
    #[must_use]
    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    /// Named fallback strategies
    #[must_use]
    pub fn strategies(&self) -> &FallbackStrategies {
        &self.strategies
    }

    /// Default retry policy
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Feature flags
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    /// Resource monitor
    #[must_use]
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Health-check payload
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        self.monitor.health_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::CircuitBreakerConfig;
    use crate::monitor::ScriptedMetrics;
    use std::collections::HashMap;

    fn plane(config: Config) -> ResiliencePlane {
        ResiliencePlane::with_source(
            config,
            Arc::new(ScriptedMetrics::new([(0.0, 0.0)])),
            Arc::new(FeatureFlags::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_overrides_reach_registry() {
        let config = Config {
            circuit_breakers: HashMap::from([(
                "billing".to_string(),
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..CircuitBreakerConfig::default()
                },
            )]),
            ..Config::default()
        };
        let plane = plane(config);
        let _ = plane
            .execute("billing", || async { Err::<(), _>(Error::connection("down")) })
            .await;
        let err = plane.execute("billing", || async { Ok(()) }).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_counts_as_one_breaker_outcome() {
        let plane = plane(Config::default());
        let _ = plane
            .execute_with_retry("ledger", || async { Err::<(), _>(Error::connection("down")) })
            .await;
        let breaker = plane.registry().get("ledger").unwrap();
        assert_eq!(breaker.failure_count(), 1);
    }
}
