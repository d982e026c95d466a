//! Failsafe mechanisms: circuit breaker, retry, graceful degradation, health tracking

mod backoff;
mod circuit_breaker;
mod degradation;
mod health;
mod registry;
mod retry;
pub mod strategies;

pub use backoff::{Backoff, JITTER_FRACTION, calculate_backoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub(crate) use circuit_breaker::deadline_after;
pub use degradation::DegradationManager;
pub use health::{ServiceHealthInfo, ServiceHealthTracker, ServiceStatus};
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    RetryAttempt, RetryOutcome, RetryPolicy, RetryPredicate, execute_with_retry,
    execute_with_retry_cancellable, with_cache_retry, with_database_retry, with_external_retry,
    with_retry, with_storage_retry,
};
pub use strategies::{Delivery, DeferredNotification, FallbackStrategies, UpdateChannel};

use std::future::Future;

use crate::Result;

/// Run `operation` with retries inside a single breaker-guarded call.
///
/// The breaker sees one outcome per call regardless of how many attempts
/// the retry loop made.
///
/// # Errors
///
/// Returns `Error::CircuitOpen` without invoking `operation` when the
/// breaker is open, otherwise the result of [`with_retry`].
pub async fn execute_protected<F, Fut, T>(
    registry: &CircuitBreakerRegistry,
    name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    registry
        .execute(name, || with_retry(policy, name, operation))
        .await
}
