//! Exponential backoff with optional jitter

use std::time::Duration;

use crate::config::RetryConfig;

/// Maximum relative perturbation applied when jitter is enabled
pub const JITTER_FRACTION: f64 = 0.25;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Perturb delays by up to +/-25%
    pub jitter: bool,
}

impl Backoff {
    /// Construct backoff parameters
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.max_backoff,
            config.multiplier,
            config.jitter,
        )
    }
}

/// `min(base * multiplier^(attempt-1), max)`, then optionally jittered by
/// up to +/-25% and floored at zero. Attempt 0 is treated as attempt 1.
#[must_use]
pub fn calculate_backoff(attempt: u32, backoff: &Backoff) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss)]
    let base_ns = backoff.base_delay.as_nanos() as f64;
    #[allow(clippy::cast_precision_loss)]
    let max_ns = backoff.max_delay.as_nanos() as f64;

    let raw = base_ns * backoff.multiplier.powi(exponent);
    // powi overflows to +inf for large exponents
    let capped = if raw.is_finite() { raw.min(max_ns) } else { max_ns };

    let delay_ns = if backoff.jitter {
        // uniform in [-1, 1)
        let unit = rand::random::<f64>().mul_add(2.0, -1.0);
        (capped + capped * JITTER_FRACTION * unit).max(0.0)
    } else {
        capped
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = delay_ns.round() as u64;
    Duration::from_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64, multiplier: f64) -> Backoff {
        Backoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            multiplier,
            false,
        )
    }

    #[test]
    fn test_exponential_growth() {
        let b = no_jitter(100, 10_000, 2.0);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(400));
        assert_eq!(b.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_monotonic_until_cap() {
        let b = no_jitter(1000, 8000, 2.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let d = b.delay(attempt);
            assert!(d >= previous, "attempt {attempt}: {d:?} < {previous:?}");
            assert!(d <= Duration::from_millis(8000));
            previous = d;
        }
        assert_eq!(b.delay(20), Duration::from_millis(8000));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let b = no_jitter(100, 5000, 10.0);
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let b = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(1000),
            2.0,
            true,
        );
        for _ in 0..500 {
            let d = b.delay(1).as_secs_f64() * 1000.0;
            assert!((750.0..=1250.0).contains(&d), "jittered delay {d}ms out of range");
        }
    }

    #[test]
    fn test_zero_base_delay() {
        let b = Backoff::new(Duration::ZERO, Duration::from_secs(1), 2.0, true);
        assert_eq!(b.delay(3), Duration::ZERO);
    }
}
