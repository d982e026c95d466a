//! Retry behavior: attempt counting, predicates, backoff timing, cancellation

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use resilience_plane::Error;
use resilience_plane::failsafe::{
    Backoff, CircuitBreakerRegistry, RetryPolicy, execute_protected, execute_with_retry,
    execute_with_retry_cancellable, with_cache_retry, with_external_retry, with_retry,
};
use tokio_util::sync::CancellationToken;

fn fixed_policy(max_attempts: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Backoff::new(
            Duration::from_millis(base_ms),
            Duration::from_secs(10),
            2.0,
            false,
        ),
    )
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_third_attempt() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let outcome = execute_with_retry(&fixed_policy(3, 100), "db.query", move || async move {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 3 {
            Err(Error::timeout("query timed out"))
        } else {
            Ok(n)
        }
    })
    .await;

    assert!(outcome.success());
    assert_eq!(outcome.result.unwrap(), 3);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.history.len(), 3);
    assert_eq!(outcome.history[0].delay, Some(Duration::from_millis(100)));
    assert_eq!(outcome.history[1].delay, Some(Duration::from_millis(200)));
    assert_eq!(outcome.history[2].delay, None);
    assert!(outcome.history[2].success);
    // two backoff sleeps: 100ms + 200ms
    assert!(outcome.total_duration >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_wrap_last_error() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let err = with_retry(&fixed_policy(3, 10), "db.query", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::connection("ECONNRESET"))
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        Error::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.is_connection());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_returns_after_one_attempt() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let err = with_external_retry("push.send", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::Unauthorized("invalid api key".into()))
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.is_authorization());
}

#[tokio::test(start_paused = true)]
async fn test_predicate_sees_attempt_number() {
    let policy = fixed_policy(5, 10).with_predicate(|_, attempt| attempt < 2);
    let outcome = execute_with_retry(&policy, "custom", || async {
        Err::<(), _>(Error::operation("flaky"))
    })
    .await;
    assert_eq!(outcome.attempts, 2);
    assert!(!outcome.success());
}

#[tokio::test(start_paused = true)]
async fn test_cache_preset_makes_two_attempts() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let result = with_cache_retry("cache.get", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::connection("redis down"))
    })
    .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = execute_with_retry_cancellable(&fixed_policy(5, 1_000), "slow", &token, || async {
        Err::<(), _>(Error::timeout("slow"))
    })
    .await;

    assert_eq!(outcome.attempts, 1);
    assert!(outcome.total_duration < Duration::from_millis(1_000));
    assert!(outcome.result.unwrap_err().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_records_one_outcome_per_protected_call() {
    let registry = CircuitBreakerRegistry::default();
    let policy = fixed_policy(3, 10);
    let calls = AtomicU32::new(0);

    for _ in 0..2 {
        let counter = &calls;
        let _ = execute_protected(&registry, "inventory", &policy, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::connection("down"))
        })
        .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(registry.get("inventory").unwrap().failure_count(), 2);
}
