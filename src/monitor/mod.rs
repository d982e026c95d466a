//! Resource monitor: periodic sampling, degradation levels, feature shedding

mod flags;
mod level;
mod metrics;

pub use flags::FeatureFlags;
pub use level::{
    DegradationLevel, DegradationState, FEATURE_ANALYTICS, FEATURE_BACKGROUND_JOBS,
    FEATURE_CACHE_WARMING, FEATURE_DETAILED_LOGGING, FEATURE_FILE_PROCESSING,
    FEATURE_RECOMMENDATIONS, ResourceThresholds, evaluate_level,
};
pub use metrics::{
    CpuMetrics, DiskMetrics, MemoryMetrics, MetricsHistory, MetricsSource, ProcessMetrics,
    ResourceMetrics, ScriptedMetrics, SystemSampler,
};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::failsafe::DegradationManager;
use crate::{Error, Result, telemetry};

/// Frees cache memory under severe pressure
#[async_trait]
pub trait CacheEvictor: Send + Sync {
    /// Evict until memory utilization is at or below `target_percent`.
    /// Returns the number of entries evicted.
    async fn evict_to(&self, target_percent: f64) -> Result<usize>;
}

/// Overall status reported by the health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No degradation and no alerts
    Healthy,
    /// Degradation active or an alert raised
    Degraded,
    /// Severe degradation
    Critical,
}

/// Health-check payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Latest sample, if any
    pub metrics: Option<ResourceMetrics>,
    /// Current degradation state
    pub degradation: DegradationState,
    /// Threshold breaches in the latest sample
    pub alerts: Vec<String>,
    /// Operator guidance for the current state
    pub recommendations: Vec<String>,
}

/// Samples resource usage and sheds optional features under pressure.
///
/// Sampling and evaluation run as two independent tasks. The latest sample
/// is published through a `watch` channel; evaluation only reads it.
pub struct ResourceMonitor {
    source: Arc<dyn MetricsSource>,
    flags: Arc<FeatureFlags>,
    evictor: Option<Arc<dyn CacheEvictor>>,
    services: Option<Arc<DegradationManager>>,
    thresholds: RwLock<ResourceThresholds>,
    state: RwLock<DegradationState>,
    history: Mutex<MetricsHistory>,
    latest: watch::Sender<Option<ResourceMetrics>>,
    /// Serializes level changes so side effects apply in order
    transition: tokio::sync::Mutex<()>,
    sample_interval: Duration,
    evaluation_interval: Duration,
    eviction_target_percent: f64,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("level", &self.level())
            .field("sample_interval", &self.sample_interval)
            .field("evaluation_interval", &self.evaluation_interval)
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    /// Create a monitor reading from `source` and writing into `flags`
    #[must_use]
    pub fn new(config: &MonitorConfig, source: Arc<dyn MetricsSource>, flags: Arc<FeatureFlags>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            source,
            flags,
            evictor: None,
            services: None,
            thresholds: RwLock::new(config.thresholds),
            state: RwLock::new(DegradationState::default()),
            history: Mutex::new(MetricsHistory::new(config.history_capacity)),
            latest,
            transition: tokio::sync::Mutex::new(()),
            sample_interval: config.sample_interval,
            evaluation_interval: config.evaluation_interval,
            eviction_target_percent: config.eviction_target_percent,
        }
    }

    /// Evictor called on entering SEVERE
    #[must_use]
    pub fn with_evictor(mut self, evictor: Arc<dyn CacheEvictor>) -> Self {
        self.evictor = Some(evictor);
        self
    }

    /// Source of unhealthy service names recorded on escalation
    #[must_use]
    pub fn with_services(mut self, services: Arc<DegradationManager>) -> Self {
        self.services = Some(services);
        self
    }

    /// Feature flags this monitor writes
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    /// Spawn the sampling and evaluation tasks; both stop on `shutdown`
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(
            sample_interval_ms = self.sample_interval.as_millis(),
            evaluation_interval_ms = self.evaluation_interval.as_millis(),
            "Starting resource monitor"
        );

        let sampler = Arc::clone(self);
        let mut sampler_shutdown = shutdown.subscribe();
        let sampling = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sampler.sample_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sampler.sample_now().await {
                            warn!(error = %e, "Resource sampling failed");
                        }
                    }
                    _ = sampler_shutdown.recv() => break,
                }
            }
            debug!("Resource sampler stopped");
        });

        let evaluator = Arc::clone(self);
        let mut evaluator_shutdown = shutdown.subscribe();
        let evaluation = tokio::spawn(async move {
            let mut interval = tokio::time::interval(evaluator.evaluation_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately, before any sample exists
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        evaluator.evaluate_now().await;
                    }
                    _ = evaluator_shutdown.recv() => break,
                }
            }
            debug!("Degradation evaluator stopped");
        });

        vec![sampling, evaluation]
    }

    /// Take a sample from the source and record it
    ///
    /// # Errors
    ///
    /// Returns the source's error; nothing is recorded in that case.
    pub async fn sample_now(&self) -> Result<ResourceMetrics> {
        let sample = self.source.sample().await?;
        self.record_sample(sample.clone());
        Ok(sample)
    }

    /// Publish a sample as the latest and append it to history
    pub fn record_sample(&self, sample: ResourceMetrics) {
        telemetry::record_resource_usage(sample.cpu.usage_percent, sample.memory.usage_percent);
        self.history.lock().push(sample.clone());
        self.latest.send_replace(Some(sample));
    }

    /// Evaluate the latest sample and apply any level change
    pub async fn evaluate_now(&self) -> DegradationLevel {
        let Some(sample) = self.latest() else {
            return self.level();
        };
        let current = self.level();
        let cpu = sample.cpu.usage_percent;
        let memory = sample.memory.usage_percent;
        let target = evaluate_level(current, cpu, memory, &self.thresholds());
        if target != current {
            let reason = format!("CPU {cpu:.1}%, memory {memory:.1}%");
            self.apply_level(target, reason).await;
        }
        target
    }

    /// Operator override: enter `level` regardless of samples
    pub async fn trigger_degradation(&self, level: DegradationLevel, reason: &str) {
        info!(level = %level, reason = %reason, "Manual degradation triggered");
        self.apply_level(level, reason.to_string()).await;
    }

    /// Operator override: return to NONE and re-enable every feature
    pub async fn trigger_recovery(&self) {
        info!("Manual recovery triggered");
        self.apply_level(DegradationLevel::None, "manual recovery".to_string())
            .await;
    }

    async fn apply_level(&self, target: DegradationLevel, reason: String) {
        let _guard = self.transition.lock().await;
        let previous = self.level();

        if target == DegradationLevel::None {
            self.flags.enable_all();
            *self.state.write() = DegradationState::default();
            telemetry::record_degradation_level(target);
            if previous != DegradationLevel::None {
                info!(previous = %previous, reason = %reason, "Recovered from degradation");
            }
            return;
        }

        let desired: BTreeSet<String> = target
            .disabled_features()
            .iter()
            .map(|f| (*f).to_string())
            .collect();
        let previously_disabled = self.state.read().disabled_features.clone();
        for feature in previously_disabled.difference(&desired) {
            self.flags.set_flag(feature, true);
        }
        for feature in &desired {
            self.flags.set_flag(feature, false);
        }

        let affected_services: BTreeSet<String> = self
            .services
            .as_ref()
            .map(|manager| {
                let mut names: BTreeSet<String> = manager.unhealthy_services().into_iter().collect();
                names.extend(manager.registry().open_circuits());
                names
            })
            .unwrap_or_default();

        {
            let mut state = self.state.write();
            let activated_at = state.activated_at.filter(|_| state.is_active).unwrap_or_else(Utc::now);
            *state = DegradationState {
                is_active: true,
                level: target,
                activated_at: Some(activated_at),
                reason: Some(reason.clone()),
                disabled_features: desired,
                affected_services,
            };
        }
        telemetry::record_degradation_level(target);

        if target > previous {
            warn!(level = %target, previous = %previous, reason = %reason, "Degradation escalated");
        } else {
            info!(level = %target, previous = %previous, reason = %reason, "Degradation eased");
        }

        if target == DegradationLevel::Severe && previous != DegradationLevel::Severe {
            self.emergency_eviction().await;
        }
    }

    async fn emergency_eviction(&self) {
        let Some(evictor) = &self.evictor else {
            debug!("No cache evictor configured, skipping emergency eviction");
            return;
        };
        let target = self.eviction_target_percent;
        match evictor.evict_to(target).await {
            Ok(evicted) => warn!(evicted, target_percent = target, "Emergency cache eviction"),
            Err(e) => error!(error = %e, target_percent = target, "Emergency cache eviction failed"),
        }
    }

    /// Replace thresholds at runtime
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the thresholds are inconsistent.
    pub fn update_thresholds(&self, thresholds: ResourceThresholds) -> Result<()> {
        thresholds.validate().map_err(Error::Config)?;
        *self.thresholds.write() = thresholds;
        info!(?thresholds, "Resource thresholds updated");
        Ok(())
    }

    /// Current thresholds
    #[must_use]
    pub fn thresholds(&self) -> ResourceThresholds {
        *self.thresholds.read()
    }

    /// Current degradation state
    #[must_use]
    pub fn state(&self) -> DegradationState {
        self.state.read().clone()
    }

    /// Current degradation level
    #[must_use]
    pub fn level(&self) -> DegradationLevel {
        self.state.read().level
    }

    /// Latest sample
    #[must_use]
    pub fn latest(&self) -> Option<ResourceMetrics> {
        self.latest.borrow().clone()
    }

    /// Receiver notified on every new sample
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ResourceMetrics>> {
        self.latest.subscribe()
    }

    /// Retained samples, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<ResourceMetrics> {
        self.history.lock().to_vec()
    }

    /// Health-check payload from the current state and latest sample
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let metrics = self.latest();
        let degradation = self.state();
        let thresholds = self.thresholds();

        let mut alerts = Vec::new();
        if let Some(m) = &metrics {
            if m.cpu.usage_percent >= thresholds.warning_cpu {
                alerts.push(format!("High CPU usage: {:.1}%", m.cpu.usage_percent));
            }
            if m.memory.usage_percent >= thresholds.warning_memory {
                alerts.push(format!("High memory usage: {:.1}%", m.memory.usage_percent));
            }
            if m.disk.usage_percent >= thresholds.warning_disk {
                alerts.push(format!("High disk usage: {:.1}%", m.disk.usage_percent));
            }
        }

        let recommendations = recommendations(degradation.level, &alerts, metrics.as_ref(), &thresholds);

        let status = if degradation.level == DegradationLevel::Severe {
            HealthStatus::Critical
        } else if degradation.is_active || !alerts.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            metrics,
            degradation,
            alerts,
            recommendations,
        }
    }
}

fn recommendations(
    level: DegradationLevel,
    alerts: &[String],
    metrics: Option<&ResourceMetrics>,
    thresholds: &ResourceThresholds,
) -> Vec<String> {
    let mut out = Vec::new();
    match level {
        DegradationLevel::None => {}
        DegradationLevel::Light => {
            out.push("Non-essential analytics paused; monitor load trend".to_string());
        }
        DegradationLevel::Moderate => {
            out.push("Recommendations paused; consider scaling out".to_string());
        }
        DegradationLevel::Severe => {
            out.push("Background work paused and caches evicted; scale out immediately".to_string());
        }
    }
    if let Some(m) = metrics {
        if m.memory.usage_percent >= thresholds.warning_memory {
            out.push("Investigate memory growth and cache sizing".to_string());
        }
        if m.disk.usage_percent >= thresholds.warning_disk {
            out.push("Free disk space or expand the volume".to_string());
        }
    }
    if out.is_empty() && !alerts.is_empty() {
        out.push("Resource usage above warning thresholds; watch for escalation".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEvictor(AtomicUsize);

    #[async_trait]
    impl CacheEvictor for CountingEvictor {
        async fn evict_to(&self, _target_percent: f64) -> Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(10)
        }
    }

    fn monitor(samples: Vec<(f64, f64)>) -> ResourceMonitor {
        ResourceMonitor::new(
            &MonitorConfig::default(),
            Arc::new(ScriptedMetrics::new(samples)),
            Arc::new(FeatureFlags::new()),
        )
    }

    #[tokio::test]
    async fn test_no_sample_keeps_level() {
        let monitor = monitor(vec![]);
        assert_eq!(monitor.evaluate_now().await, DegradationLevel::None);
        assert_eq!(monitor.health_report().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_severe_evicts_once() {
        let evictor = Arc::new(CountingEvictor(AtomicUsize::new(0)));
        let monitor = monitor(vec![(90.0, 40.0), (91.0, 40.0)]).with_evictor(evictor.clone());
        monitor.sample_now().await.unwrap();
        monitor.evaluate_now().await;
        monitor.sample_now().await.unwrap();
        monitor.evaluate_now().await;
        assert_eq!(evictor.0.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.health_report().status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_de_escalation_restores_higher_level_features() {
        let monitor = monitor(vec![]);
        monitor
            .trigger_degradation(DegradationLevel::Severe, "load test")
            .await;
        assert!(!monitor.flags().is_enabled(FEATURE_CACHE_WARMING));

        monitor.trigger_degradation(DegradationLevel::Light, "easing").await;
        assert!(monitor.flags().is_enabled(FEATURE_CACHE_WARMING));
        assert!(monitor.flags().is_enabled(FEATURE_RECOMMENDATIONS));
        assert!(!monitor.flags().is_enabled(FEATURE_ANALYTICS));

        monitor.trigger_recovery().await;
        assert!(monitor.flags().is_enabled(FEATURE_ANALYTICS));
        assert!(!monitor.state().is_active);
    }

    #[tokio::test]
    async fn test_activated_at_kept_across_levels() {
        let monitor = monitor(vec![]);
        monitor.trigger_degradation(DegradationLevel::Light, "a").await;
        let first = monitor.state().activated_at;
        monitor.trigger_degradation(DegradationLevel::Moderate, "b").await;
        assert_eq!(monitor.state().activated_at, first);
        assert_eq!(monitor.state().reason.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_alerts_mark_degraded() {
        let monitor = monitor(vec![]);
        monitor.record_sample(ResourceMetrics::from_usage(72.0, 10.0));
        let report = monitor.health_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.alerts.len(), 1);
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let monitor = monitor(vec![]);
        let bad = ResourceThresholds {
            warning_cpu: 95.0,
            ..ResourceThresholds::default()
        };
        assert!(matches!(monitor.update_thresholds(bad), Err(Error::Config(_))));
        assert_eq!(monitor.thresholds(), ResourceThresholds::default());
    }
}
