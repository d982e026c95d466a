//! Graceful degradation: primary through a circuit breaker, fallback on failure

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use super::execute_protected;
use super::health::{ServiceHealthInfo, ServiceHealthTracker};
use super::registry::CircuitBreakerRegistry;
use super::retry::RetryPolicy;
use crate::config::DegradationConfig;
use crate::{Error, Result, telemetry};

/// Runs primary operations through the breaker registry and substitutes
/// fallbacks when they fail.
///
/// A failing fallback never replaces the primary's error: callers always
/// see the root cause.
#[derive(Debug)]
pub struct DegradationManager {
    registry: Arc<CircuitBreakerRegistry>,
    health: ServiceHealthTracker,
    fallback_enabled: AtomicBool,
    fallback_timeout: Duration,
}

impl DegradationManager {
    /// Create a manager over a shared breaker registry
    #[must_use]
    pub fn new(registry: Arc<CircuitBreakerRegistry>, config: &DegradationConfig) -> Self {
        Self {
            registry,
            health: ServiceHealthTracker::new(),
            fallback_enabled: AtomicBool::new(config.fallback_enabled),
            fallback_timeout: config.fallback_timeout,
        }
    }

    /// Breaker registry used for primary calls
    #[must_use]
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Run `primary` through the `service` breaker, recording health.
    ///
    /// # Errors
    ///
    /// Returns the primary's error, or `Error::CircuitOpen` if the breaker
    /// rejected the call.
    pub async fn execute<P, PF, T>(&self, service: &str, primary: P) -> Result<T>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match self.registry.execute(service, primary).await {
            Ok(value) => {
                self.health.record_success(service, started.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.health.record_failure(service, &e.to_string());
                Err(e)
            }
        }
    }

    /// Like [`Self::execute`], retrying transient failures under `policy`
    /// inside a single breaker-guarded call.
    ///
    /// # Errors
    ///
    /// Returns `Error::CircuitOpen`, `Error::RetriesExhausted` or the
    /// primary's non-retryable error.
    pub async fn execute_with_retry<P, PF, T>(
        &self,
        service: &str,
        policy: &RetryPolicy,
        primary: P,
    ) -> Result<T>
    where
        P: FnMut() -> PF,
        PF: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let outcome = execute_protected(&self.registry, service, policy, primary).await;
        match &outcome {
            Ok(_) => self.health.record_success(service, started.elapsed()),
            Err(e) => self.health.record_failure(service, &e.to_string()),
        }
        outcome
    }

    /// Run `primary`; on failure run `fallback` under the fallback timeout.
    ///
    /// # Errors
    ///
    /// Returns the primary's error when fallbacks are disabled or when the
    /// fallback fails or times out.
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
        let primary_error = match self.execute(service, primary).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        self.fallback(service, primary_error, fallback).await
    }

    /// Run `fallback` for a primary that already failed with `primary_error`
    pub(crate) async fn fallback<F, FF, T>(
        &self,
        service: &str,
        primary_error: Error,
        fallback: F,
    ) -> Result<T>
    where
        F: FnOnce() -> FF,
        FF: Future<Output = Result<T>>,
    {
        if !self.fallback_enabled() {
            return Err(primary_error);
        }

        match timeout(self.fallback_timeout, fallback()).await {
            Ok(Ok(value)) => {
                self.record_fallback_used(service);
                info!(service = %service, error = %primary_error, "Primary failed, served fallback");
                Ok(value)
            }
            Ok(Err(fallback_error)) => {
                telemetry::record_fallback(service, "failure");
                warn!(
                    service = %service,
                    error = %primary_error,
                    fallback_error = %fallback_error,
                    "Fallback failed"
                );
                Err(primary_error)
            }
            Err(_) => {
                telemetry::record_fallback(service, "timeout");
                warn!(
                    service = %service,
                    error = %primary_error,
                    timeout_ms = self.fallback_timeout.as_millis(),
                    "Fallback timed out"
                );
                Err(primary_error)
            }
        }
    }

    /// Count a fallback result served outside [`Self::fallback`]
    pub(crate) fn record_fallback_used(&self, service: &str) {
        self.health.record_fallback(service);
        telemetry::record_fallback(service, "success");
    }

    /// Whether fallbacks run on primary failure
    #[must_use]
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled.load(Ordering::Relaxed)
    }

    /// Globally enable or disable fallbacks
    pub fn set_fallback_enabled(&self, enabled: bool) {
        let previous = self.fallback_enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!(enabled, "Fallback mode changed");
        }
    }

    /// Hard deadline applied to every fallback
    #[must_use]
    pub fn fallback_timeout(&self) -> Duration {
        self.fallback_timeout
    }

    /// Health snapshot for one service
    #[must_use]
    pub fn service_health(&self, service: &str) -> Option<ServiceHealthInfo> {
        self.health.get(service)
    }

    /// Health snapshots for every service seen so far
    #[must_use]
    pub fn all_service_health(&self) -> HashMap<String, ServiceHealthInfo> {
        self.health.all()
    }

    /// Unknown services count as healthy
    #[must_use]
    pub fn is_service_healthy(&self, service: &str) -> bool {
        self.health.is_healthy(service)
    }

    /// Services currently degraded or unavailable
    #[must_use]
    pub fn unhealthy_services(&self) -> Vec<String> {
        self.health.unhealthy()
    }
}
