//! Resilience Plane Library
//!
//! Protects a request-serving backend from cascading dependency failures
//! and local resource exhaustion.
//!
//! # Features
//!
//! - **Circuit Breakers**: per-dependency three-state gates, lazily created by name
//! - **Retries**: exponential backoff with jitter and per-category retry predicates
//! - **Graceful Degradation**: fallbacks under a hard timeout, per-service health
//! - **Resource Monitor**: CPU/memory sampling with hysteresis and feature shedding
//! - **Feature Flags**: cheap boolean gates for optional work
//! - **Operations**: health check, admin endpoints, Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod monitor;
pub mod plane;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};
pub use plane::ResiliencePlane;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
