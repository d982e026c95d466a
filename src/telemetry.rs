//! Metric emission through the `metrics` facade
//!
//! Without an installed recorder every call is a no-op, so library users and
//! tests pay nothing. The `metrics` feature installs a Prometheus recorder.

use telemetry_metrics::{counter, gauge};

use crate::failsafe::CircuitState;
use crate::monitor::DegradationLevel;

/// Circuit breaker state changes, labelled with the new state
pub fn record_circuit_transition(service: &str, state: CircuitState) {
    counter!(
        "resilience_circuit_transitions_total",
        "service" => service.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Requests refused by an open circuit
pub fn record_circuit_rejection(service: &str) {
    counter!("resilience_circuit_rejections_total", "service" => service.to_string()).increment(1);
}

/// Retry attempts beyond the first
pub fn record_retry_attempt(operation: &str) {
    counter!("resilience_retry_attempts_total", "operation" => operation.to_string()).increment(1);
}

/// Fallback executions, `outcome` is `success`, `failure` or `timeout`
pub fn record_fallback(service: &str, outcome: &'static str) {
    counter!(
        "resilience_fallbacks_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Current degradation level (0 = none .. 3 = severe)
pub fn record_degradation_level(level: DegradationLevel) {
    gauge!("resilience_degradation_level").set(f64::from(level.severity()));
}

/// Latest CPU and memory utilization samples
pub fn record_resource_usage(cpu_percent: f64, memory_percent: f64) {
    gauge!("resilience_cpu_usage_percent").set(cpu_percent);
    gauge!("resilience_memory_usage_percent").set(memory_percent);
}

/// Install the Prometheus recorder and return its render handle
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
#[cfg(feature = "metrics")]
pub fn install_prometheus() -> crate::Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::Error::Internal(format!("Failed to install metrics recorder: {e}")))
}
