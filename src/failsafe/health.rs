//! Per-service health tracking for the degradation manager
//!
//! Tracks, for every service name seen:
//! - Status (healthy, degraded, unavailable)
//! - Last check and last error
//! - When the current outage began
//! - Fallback, success and failure counts

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

/// Health of a dependency as seen by the degradation manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Primary calls are succeeding
    Healthy,
    /// Primary failed, a fallback is serving requests
    Degraded,
    /// Primary failed with no working fallback
    Unavailable,
}

/// Health record for one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthInfo {
    /// Service name
    pub service: String,
    /// Current status
    pub status: ServiceStatus,
    /// Last time any outcome was recorded
    pub last_check: DateTime<Utc>,
    /// Message of the most recent primary failure, cleared on recovery
    pub last_error: Option<String>,
    /// Start of the current outage, cleared on recovery
    pub degraded_since: Option<DateTime<Utc>>,
    /// Fallbacks that produced a result (monotonic)
    pub fallbacks_used: u64,
    /// Primary successes
    pub success_count: u64,
    /// Primary failures
    pub failure_count: u64,
    /// Duration of the last successful primary call (milliseconds)
    pub last_latency_ms: Option<u64>,
}

impl ServiceHealthInfo {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            status: ServiceStatus::Healthy,
            last_check: Utc::now(),
            last_error: None,
            degraded_since: None,
            fallbacks_used: 0,
            success_count: 0,
            failure_count: 0,
            last_latency_ms: None,
        }
    }
}

/// Health records keyed by service name.
///
/// Mutations for one name happen under that entry's shard lock; callers
/// outside the failsafe module only get snapshots.
#[derive(Debug, Default)]
pub struct ServiceHealthTracker {
    services: DashMap<String, ServiceHealthInfo>,
}

impl ServiceHealthTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful primary call
    pub(crate) fn record_success(&self, service: &str, latency: Duration) {
        let mut entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealthInfo::new(service));
        let info = entry.value_mut();
        if info.status != ServiceStatus::Healthy {
            info!(service = %service, previous = ?info.status, "Service recovered");
        }
        info.status = ServiceStatus::Healthy;
        info.last_check = Utc::now();
        info.last_error = None;
        info.degraded_since = None;
        info.success_count += 1;
        info.last_latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    /// Record a failed primary call
    pub(crate) fn record_failure(&self, service: &str, error: &str) {
        let mut entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealthInfo::new(service));
        let info = entry.value_mut();
        let now = Utc::now();
        if info.degraded_since.is_none() {
            warn!(service = %service, error = %error, "Service unavailable");
            info.degraded_since = Some(now);
        }
        info.status = ServiceStatus::Unavailable;
        info.last_check = now;
        info.last_error = Some(error.to_string());
        info.failure_count += 1;
    }

    /// Record a fallback that produced a result
    pub(crate) fn record_fallback(&self, service: &str) {
        let mut entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealthInfo::new(service));
        let info = entry.value_mut();
        info.status = ServiceStatus::Degraded;
        info.last_check = Utc::now();
        info.fallbacks_used += 1;
    }

    /// Snapshot for one service
    #[must_use]
    pub fn get(&self, service: &str) -> Option<ServiceHealthInfo> {
        self.services.get(service).map(|info| info.clone())
    }

    /// Snapshot of every tracked service
    #[must_use]
    pub fn all(&self) -> HashMap<String, ServiceHealthInfo> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Unknown services count as healthy
    #[must_use]
    pub fn is_healthy(&self, service: &str) -> bool {
        self.services
            .get(service)
            .is_none_or(|info| info.status == ServiceStatus::Healthy)
    }

    /// Names of services not currently healthy, sorted
    #[must_use]
    pub fn unhealthy(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| entry.status != ServiceStatus::Healthy)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_sets_degraded_since_once() {
        let tracker = ServiceHealthTracker::new();
        tracker.record_failure("redis", "refused");
        let first = tracker.get("redis").unwrap();
        assert_eq!(first.status, ServiceStatus::Unavailable);
        let since = first.degraded_since.unwrap();

        tracker.record_failure("redis", "reset");
        let second = tracker.get("redis").unwrap();
        assert_eq!(second.degraded_since, Some(since));
        assert_eq!(second.last_error.as_deref(), Some("reset"));
        assert_eq!(second.failure_count, 2);
    }

    #[test]
    fn test_recovery_clears_outage() {
        let tracker = ServiceHealthTracker::new();
        tracker.record_failure("database", "timeout");
        tracker.record_fallback("database");
        assert_eq!(tracker.get("database").unwrap().status, ServiceStatus::Degraded);
        assert!(!tracker.is_healthy("database"));

        tracker.record_success("database", Duration::from_millis(12));
        let info = tracker.get("database").unwrap();
        assert_eq!(info.status, ServiceStatus::Healthy);
        assert!(info.degraded_since.is_none());
        assert!(info.last_error.is_none());
        assert_eq!(info.fallbacks_used, 1);
        assert_eq!(info.last_latency_ms, Some(12));
    }

    #[test]
    fn test_unknown_service_is_healthy() {
        let tracker = ServiceHealthTracker::new();
        assert!(tracker.is_healthy("never-seen"));
        assert!(tracker.unhealthy().is_empty());
    }
}
