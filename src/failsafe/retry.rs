//! Retry logic with exponential backoff

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::Backoff;
use crate::config::RetryConfig;
use crate::{Error, Result, telemetry};

/// Decides whether a failed attempt (1-based) should be retried
pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Retry policy configuration
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
    should_retry: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy retrying transient errors
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            should_retry: Arc::new(|e: &Error, _| e.is_transient()),
        }
    }

    /// Create from config
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Backoff::from(config))
    }

    /// Replace the retry predicate
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Database calls: connection and timeout errors only, 3 attempts, 1s..8s
    #[must_use]
    pub fn database() -> Self {
        Self::new(
            3,
            Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0, true),
        )
        .with_predicate(|e, _| e.is_connection() || e.is_timeout())
    }

    /// Cache calls: 2 attempts, 100ms..1s, no jitter
    #[must_use]
    pub fn cache() -> Self {
        Self::new(
            2,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, false),
        )
    }

    /// Third-party APIs: anything except authorization failures and open circuits
    #[must_use]
    pub fn external_service() -> Self {
        Self::new(
            3,
            Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0, true),
        )
        .with_predicate(|e, _| !e.is_authorization() && !e.is_circuit_open())
    }

    /// Object storage: 3 attempts, 500ms..5s
    #[must_use]
    pub fn storage() -> Self {
        Self::new(
            3,
            Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 2.0, true),
        )
    }

    /// Whether `error` from the given attempt is eligible for another try
    #[must_use]
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        (self.should_retry)(error, attempt)
    }
}

/// One attempt of a retried operation
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Time spent in the operation
    pub elapsed: Duration,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Failure message, if any
    pub error: Option<String>,
    /// Delay scheduled before the next attempt
    pub delay: Option<Duration>,
}

/// Result envelope of [`execute_with_retry`]
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value of the successful attempt, or the last error
    pub result: Result<T>,
    /// Operation invocations made
    pub attempts: u32,
    /// Wall time including backoff sleeps
    pub total_duration: Duration,
    /// Per-attempt record
    pub history: Vec<RetryAttempt>,
}

impl<T> RetryOutcome<T> {
    /// Whether an attempt succeeded
    #[must_use]
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `operation` up to `policy.max_attempts` times, returning the envelope
pub async fn execute_with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(policy, name, None, operation).await
}

/// Like [`execute_with_retry`], but stops waiting as soon as `token` is
/// cancelled and returns the last error
pub async fn execute_with_retry_cancellable<F, Fut, T>(
    policy: &RetryPolicy,
    name: &str,
    token: &CancellationToken,
    operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(policy, name, Some(token), operation).await
}

async fn run<F, Fut, T>(
    policy: &RetryPolicy,
    name: &str,
    token: Option<&CancellationToken>,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    let mut history = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let attempt_started = Instant::now();
        let outcome = operation().await;
        let elapsed = attempt_started.elapsed();

        let error = match outcome {
            Ok(value) => {
                history.push(RetryAttempt {
                    attempt,
                    elapsed,
                    success: true,
                    error: None,
                    delay: None,
                });
                if attempt > 1 {
                    debug!(operation = name, attempts = attempt, "Succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_duration: started.elapsed(),
                    history,
                };
            }
            Err(e) => e,
        };

        let retry = attempt < max_attempts && policy.should_retry(&error, attempt);
        let cancelled = token.is_some_and(CancellationToken::is_cancelled);
        if !retry || cancelled {
            if attempt >= max_attempts {
                warn!(operation = name, attempts = attempt, error = %error, "Max retry attempts reached");
            } else {
                debug!(operation = name, attempt, cancelled, error = %error, "Not retrying");
            }
            history.push(RetryAttempt {
                attempt,
                elapsed,
                success: false,
                error: Some(error.to_string()),
                delay: None,
            });
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                total_duration: started.elapsed(),
                history,
            };
        }

        let delay = policy.backoff.delay(attempt);
        debug!(
            operation = name,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after backoff"
        );
        telemetry::record_retry_attempt(name);
        history.push(RetryAttempt {
            attempt,
            elapsed,
            success: false,
            error: Some(error.to_string()),
            delay: Some(delay),
        });

        if let Some(token) = token {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(operation = name, attempt, "Retry cancelled during backoff");
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                        history,
                    };
                }
                () = sleep(delay) => {}
            }
        } else {
            sleep(delay).await;
        }
    }
}

/// Execute a future with retry logic
///
/// # Errors
///
/// Returns `Error::RetriesExhausted` wrapping the last error when every
/// attempt failed, or the raw error when the policy declined to retry it.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = execute_with_retry(policy, name, operation).await;
    match outcome.result {
        Ok(value) => Ok(value),
        Err(e) if policy.max_attempts > 1 && outcome.attempts >= policy.max_attempts => {
            Err(Error::RetriesExhausted {
                attempts: outcome.attempts,
                source: Box::new(e),
            })
        }
        Err(e) => Err(e),
    }
}

/// [`with_retry`] using [`RetryPolicy::database`]
///
/// # Errors
///
/// See [`with_retry`].
pub async fn with_database_retry<F, Fut, T>(name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry(&RetryPolicy::database(), name, operation).await
}

/// [`with_retry`] using [`RetryPolicy::cache`]
///
/// # Errors
///
/// See [`with_retry`].
pub async fn with_cache_retry<F, Fut, T>(name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry(&RetryPolicy::cache(), name, operation).await
}

/// [`with_retry`] using [`RetryPolicy::external_service`]
///
/// # Errors
///
/// See [`with_retry`].
pub async fn with_external_retry<F, Fut, T>(name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry(&RetryPolicy::external_service(), name, operation).await
}

/// [`with_retry`] using [`RetryPolicy::storage`]
///
/// # Errors
///
/// See [`with_retry`].
pub async fn with_storage_retry<F, Fut, T>(name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry(&RetryPolicy::storage(), name, operation).await
}
