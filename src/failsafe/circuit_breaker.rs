//! Circuit breaker implementation
//!
//! ```text
//! Closed   → Open:     consecutive failures >= failure_threshold
//! Open     → HalfOpen: first admission at or after next_attempt
//! HalfOpen → Closed:   consecutive successes >= success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! A single success while closed forgives all prior failures.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::telemetry;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing trial calls to test recovery)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Mutable breaker state; every transition happens under one lock
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            last_success: None,
            next_attempt: None,
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        self.next_attempt
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }
}

/// Circuit breaker guarding one named dependency
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    /// Configuration (immutable after construction)
    config: CircuitBreakerConfig,
    /// State and consecutive counters
    inner: Mutex<BreakerInner>,
    /// Admission attempts observed
    total_requests: AtomicU64,
    /// Admissions refused while open
    rejected_requests: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config: config.clone(),
            inner: Mutex::new(BreakerInner::new()),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was built with
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` if the circuit admits it.
    ///
    /// The operation's own error is always returned unchanged; an open circuit
    /// yields `Error::CircuitOpen` without invoking the operation.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Admission decision with side effects: counts the request and, when the
    /// open timeout has elapsed, moves the circuit to half-open.
    pub fn try_acquire(&self) -> Result<()> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if inner.next_attempt.is_none_or(|at| now >= at) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    debug!(service = %self.name, "Open timeout elapsed, admitting trial call");
                    Ok(())
                } else {
                    self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_circuit_rejection(&self.name);
                    let retry_after = inner.retry_after(now);
                    debug!(
                        service = %self.name,
                        retry_after_ms = retry_after.as_millis(),
                        "Circuit open, rejecting request"
                    );
                    Err(Error::CircuitOpen {
                        service: self.name.clone(),
                        retry_after,
                    })
                }
            }
        }
    }

    /// Admission decision without side effects
    #[must_use]
    pub fn is_request_allowed(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner.next_attempt.is_none_or(|at| Instant::now() >= at),
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        inner.last_success = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.successes = inner.successes.saturating_add(1);
                if inner.failures > 0 {
                    tracing::trace!(service = %self.name, forgiven = inner.failures, "Success in closed state, reset failure count");
                }
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes = inner.successes.saturating_add(1);
                debug!(
                    service = %self.name,
                    successes = inner.successes,
                    threshold = self.config.success_threshold,
                    "Success in half-open state"
                );
                if inner.successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // only half-open successes count toward closing
                tracing::trace!(service = %self.name, "Late success ignored in open state");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.successes = 0;
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                debug!(
                    service = %self.name,
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    "Failure in closed state"
                );
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.name, "Trial call failed in half-open state, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                tracing::trace!(service = %self.name, "Late failure recorded in open state");
            }
        }
    }

    /// Operator escape hatch: close the circuit and zero all counters
    pub fn force_reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        let (last_failure, last_success) = (inner.last_failure, inner.last_success);
        *inner = BreakerInner {
            last_failure,
            last_success,
            ..BreakerInner::new()
        };
        if previous != CircuitState::Closed {
            telemetry::record_circuit_transition(&self.name, CircuitState::Closed);
        }
        info!(service = %self.name, from = %previous, "Circuit breaker force-reset to closed");
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive failure count
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Current consecutive success count
    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.inner.lock().successes
    }

    /// Total admission attempts observed
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Snapshot for health reporting
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let now = Instant::now();
        let next_attempt_in_ms = match inner.state {
            CircuitState::Open => {
                Some(u64::try_from(inner.retry_after(now).as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: if self.config.enabled {
                inner.state
            } else {
                CircuitState::Closed
            },
            enabled: self.config.enabled,
            failures: inner.failures,
            successes: inner.successes,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            next_attempt_in_ms,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            reset_timeout_ms: u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX),
            monitoring_period_ms: u64::try_from(self.config.monitoring_period.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Human-readable status line for operators
    #[must_use]
    pub fn status_message(&self) -> String {
        if !self.config.enabled {
            return format!("Service '{}' circuit breaker is closed (disabled)", self.name);
        }

        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => format!(
                "Service '{}' circuit breaker is closed ({} consecutive failures)",
                self.name, inner.failures
            ),
            CircuitState::Open => format!(
                "Service '{}' circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                inner.failures,
                inner.retry_after(Instant::now()).as_secs()
            ),
            CircuitState::HalfOpen => format!(
                "Service '{}' circuit breaker is half-open, testing recovery ({}/{} successes)",
                self.name, inner.successes, self.config.success_threshold
            ),
        }
    }

    /// Transition to a new state; caller holds the lock
    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
                inner.next_attempt = None;
                info!(service = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.successes = 0;
                inner.next_attempt = Some(deadline_after(Instant::now(), self.config.reset_timeout));
                warn!(
                    service = %self.name,
                    failures = inner.failures,
                    reset_timeout_ms = self.config.reset_timeout.as_millis(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.next_attempt = None;
                info!(service = %self.name, "Circuit breaker half-open");
            }
        }

        telemetry::record_circuit_transition(&self.name, new_state);
    }
}

/// `now + after`, saturating at a far-future instant instead of overflowing
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Roughly thirty years
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Circuit breaker snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Whether the breaker gates admission at all
    pub enabled: bool,
    /// Consecutive failures
    pub failures: u32,
    /// Consecutive successes
    pub successes: u32,
    /// Admission attempts observed
    pub total_requests: u64,
    /// Admissions refused while open
    pub rejected_requests: u64,
    /// Last failure timestamp
    pub last_failure: Option<DateTime<Utc>>,
    /// Last success timestamp
    pub last_success: Option<DateTime<Utc>>,
    /// Milliseconds until a trial call is admitted (open state only)
    pub next_attempt_in_ms: Option<u64>,
    /// Failures that open the circuit
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit
    pub success_threshold: u32,
    /// Open timeout in milliseconds
    pub reset_timeout_ms: u64,
    /// Monitoring period in milliseconds
    pub monitoring_period_ms: u64,
}
