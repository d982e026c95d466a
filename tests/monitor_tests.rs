//! Resource monitor scenarios: level escalation, hysteresis, feature shedding
//! and the background sampling loop

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use resilience_plane::Result;
use resilience_plane::config::MonitorConfig;
use resilience_plane::monitor::{
    CacheEvictor, DegradationLevel, FEATURE_ANALYTICS, FEATURE_BACKGROUND_JOBS,
    FEATURE_CACHE_WARMING, FEATURE_DETAILED_LOGGING, FEATURE_FILE_PROCESSING,
    FEATURE_RECOMMENDATIONS, FeatureFlags, HealthStatus, ResourceMonitor, ScriptedMetrics,
};
use tokio::sync::broadcast;

fn monitor(samples: Vec<(f64, f64)>) -> ResourceMonitor {
    ResourceMonitor::new(
        &MonitorConfig::default(),
        Arc::new(ScriptedMetrics::new(samples)),
        Arc::new(FeatureFlags::new()),
    )
}

async fn step(monitor: &ResourceMonitor) -> DegradationLevel {
    monitor.sample_now().await.unwrap();
    monitor.evaluate_now().await
}

#[derive(Default)]
struct RecordingEvictor {
    calls: AtomicUsize,
}

#[async_trait]
impl CacheEvictor for RecordingEvictor {
    async fn evict_to(&self, target_percent: f64) -> Result<usize> {
        assert!(target_percent > 0.0 && target_percent < 100.0);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(128)
    }
}

#[tokio::test]
async fn test_cpu_spike_goes_straight_to_severe() {
    let monitor = monitor(vec![
        (50.0, 40.0),
        (50.0, 40.0),
        (88.0, 40.0),
        (88.0, 40.0),
        (88.0, 40.0),
    ]);

    let mut levels = Vec::new();
    let mut analytics = Vec::new();
    for _ in 0..5 {
        levels.push(step(&monitor).await);
        analytics.push(monitor.flags().is_enabled(FEATURE_ANALYTICS));
    }

    use DegradationLevel::{None, Severe};
    assert_eq!(levels, vec![None, None, Severe, Severe, Severe]);
    assert_eq!(analytics, vec![true, true, false, false, false]);
}

#[tokio::test]
async fn test_recovery_requires_dropping_below_recovery_thresholds() {
    let monitor = monitor(vec![(50.0, 40.0), (90.0, 40.0), (65.0, 40.0), (55.0, 40.0)]);

    assert_eq!(step(&monitor).await, DegradationLevel::None);
    assert_eq!(step(&monitor).await, DegradationLevel::Severe);
    // between recovery and warning: hold the current level
    assert_eq!(step(&monitor).await, DegradationLevel::Severe);
    assert!(!monitor.flags().is_enabled(FEATURE_FILE_PROCESSING));

    assert_eq!(step(&monitor).await, DegradationLevel::None);
    assert!(!monitor.state().is_active);
    for feature in [
        FEATURE_ANALYTICS,
        FEATURE_DETAILED_LOGGING,
        FEATURE_RECOMMENDATIONS,
        FEATURE_BACKGROUND_JOBS,
        FEATURE_CACHE_WARMING,
        FEATURE_FILE_PROCESSING,
    ] {
        assert!(monitor.flags().is_enabled(feature), "{feature} still disabled");
    }
}

#[tokio::test]
async fn test_levels_disable_cumulative_feature_sets() {
    let monitor = monitor(vec![(72.0, 40.0), (72.0, 80.0)]);

    assert_eq!(step(&monitor).await, DegradationLevel::Light);
    let flags = monitor.flags();
    assert!(!flags.is_enabled(FEATURE_ANALYTICS));
    assert!(!flags.is_enabled(FEATURE_DETAILED_LOGGING));
    assert!(flags.is_enabled(FEATURE_RECOMMENDATIONS));

    assert_eq!(step(&monitor).await, DegradationLevel::Moderate);
    assert!(!flags.is_enabled(FEATURE_RECOMMENDATIONS));
    assert!(flags.is_enabled(FEATURE_BACKGROUND_JOBS));
    assert!(flags.is_enabled(FEATURE_CACHE_WARMING));

    let state = monitor.state();
    assert!(state.is_active);
    assert_eq!(state.disabled_features.len(), 3);
    assert!(state.reason.unwrap().contains("CPU 72.0%"));
}

#[tokio::test]
async fn test_memory_pressure_alone_escalates() {
    let monitor = monitor(vec![(10.0, 91.0)]);
    assert_eq!(step(&monitor).await, DegradationLevel::Severe);
}

#[tokio::test]
async fn test_eviction_runs_once_per_severe_entry() {
    let evictor = Arc::new(RecordingEvictor::default());
    let monitor = monitor(vec![(90.0, 40.0), (90.0, 40.0), (30.0, 30.0), (95.0, 40.0)])
        .with_evictor(evictor.clone());

    step(&monitor).await;
    step(&monitor).await;
    assert_eq!(evictor.calls.load(Ordering::SeqCst), 1);

    step(&monitor).await;
    step(&monitor).await;
    assert_eq!(evictor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_health_report_tracks_level() {
    let monitor = monitor(vec![(20.0, 30.0)]);
    step(&monitor).await;
    let report = monitor.health_report();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.alerts.is_empty());
    assert!(report.metrics.is_some());

    monitor
        .trigger_degradation(DegradationLevel::Moderate, "load test")
        .await;
    assert_eq!(monitor.health_report().status, HealthStatus::Degraded);

    monitor
        .trigger_degradation(DegradationLevel::Severe, "load test")
        .await;
    let report = monitor.health_report();
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(!report.recommendations.is_empty());

    monitor.trigger_recovery().await;
    assert_eq!(monitor.health_report().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = MonitorConfig {
        history_capacity: 3,
        ..MonitorConfig::default()
    };
    let monitor = ResourceMonitor::new(
        &config,
        Arc::new(ScriptedMetrics::new([(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)])),
        Arc::new(FeatureFlags::new()),
    );
    for _ in 0..4 {
        monitor.sample_now().await.unwrap();
    }
    let cpu: Vec<f64> = monitor
        .history()
        .iter()
        .map(|m| m.cpu.usage_percent)
        .collect();
    assert_eq!(cpu, vec![2.0, 3.0, 4.0]);
}

#[tokio::test(start_paused = true)]
async fn test_background_tasks_sample_and_evaluate() {
    let config = MonitorConfig {
        sample_interval: Duration::from_secs(1),
        evaluation_interval: Duration::from_secs(10),
        ..MonitorConfig::default()
    };
    let monitor = Arc::new(ResourceMonitor::new(
        &config,
        Arc::new(ScriptedMetrics::new([(92.0, 40.0)])),
        Arc::new(FeatureFlags::new()),
    ));
    let mut latest = monitor.subscribe();

    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = monitor.start(&shutdown_tx);

    latest.changed().await.unwrap();
    assert!(latest.borrow().is_some());

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(monitor.level(), DegradationLevel::Severe);
    assert!(!monitor.flags().is_enabled(FEATURE_CACHE_WARMING));

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
