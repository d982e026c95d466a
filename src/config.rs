//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::monitor::ResourceThresholds;
use crate::{Error, Result};

/// Upper bound on any configured duration (one year)
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP surface (health check + admin)
    pub server: ServerConfig,
    /// Default circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-dependency circuit breaker overrides, keyed by dependency name
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    /// Default retry configuration
    pub retry: RetryConfig,
    /// Graceful degradation configuration
    pub degradation: DegradationConfig,
    /// Resource monitor configuration
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // RESILIENCE_MONITOR__SAMPLE_INTERVAL=5s -> monitor.sample_interval
        figment = figment.merge(Env::prefixed("RESILIENCE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Semantic validation beyond what serde checks
    ///
    /// # Errors
    ///
    /// Returns every problem found, joined into one `Error::Config`.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let breakers = std::iter::once(("default", &self.circuit_breaker)).chain(
            self.circuit_breakers
                .iter()
                .map(|(name, cfg)| (name.as_str(), cfg)),
        );
        for (name, cb) in breakers {
            for (field, value) in [
                ("reset_timeout", cb.reset_timeout),
                ("monitoring_period", cb.monitoring_period),
            ] {
                if value > MAX_DURATION {
                    problems.push(format!("circuit breaker '{name}': {field} exceeds {MAX_DURATION:?}"));
                }
            }
            if cb.failure_threshold == 0 {
                problems.push(format!("circuit breaker '{name}': failure_threshold must be > 0"));
            }
            if cb.success_threshold == 0 {
                problems.push(format!("circuit breaker '{name}': success_threshold must be > 0"));
            }
        }

        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.multiplier < 1.0 {
            problems.push("retry.multiplier must be >= 1.0".to_string());
        }
        if self.monitor.sample_interval.is_zero() || self.monitor.evaluation_interval.is_zero() {
            problems.push("monitor intervals must be non-zero".to_string());
        }
        for (field, value) in [
            ("server.shutdown_timeout", self.server.shutdown_timeout),
            ("retry.initial_backoff", self.retry.initial_backoff),
            ("retry.max_backoff", self.retry.max_backoff),
            ("degradation.fallback_timeout", self.degradation.fallback_timeout),
            ("degradation.cached_listing_ttl", self.degradation.cached_listing_ttl),
            ("degradation.polling_interval", self.degradation.polling_interval),
            ("monitor.sample_interval", self.monitor.sample_interval),
            ("monitor.evaluation_interval", self.monitor.evaluation_interval),
        ] {
            if value > MAX_DURATION {
                problems.push(format!("{field} exceeds {MAX_DURATION:?}"));
            }
        }
        if self.monitor.history_capacity == 0 {
            problems.push("monitor.history_capacity must be > 0".to_string());
        }
        if let Err(e) = self.monitor.thresholds.validate() {
            problems.push(e);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Bearer token required on `/admin/*` routes (`None` leaves them open).
    /// Supports `env:VAR_NAME`.
    pub admin_token: Option<String>,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            admin_token: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Resolve the admin token (expand `env:` references)
    #[must_use]
    pub fn resolve_admin_token(&self) -> Option<String> {
        self.admin_token.as_ref().map(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                std::env::var(var_name).unwrap_or_else(|_| token.clone())
            } else {
                token.clone()
            }
        })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes to close
    pub success_threshold: u32,
    /// Time to wait in the open state before a half-open trial call
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Monitoring period (informational, reported in stats)
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    fn preset(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
            ..Self::default()
        }
    }

    /// Database dependencies: tolerate a few blips, cool down for a minute
    #[must_use]
    pub fn database() -> Self {
        Self::preset(5, 3, Duration::from_secs(60))
    }

    /// Cache dependencies: trip early, recover quickly
    #[must_use]
    pub fn cache() -> Self {
        Self::preset(3, 2, Duration::from_secs(30))
    }

    /// Object storage dependencies
    #[must_use]
    pub fn storage() -> Self {
        Self::preset(5, 2, Duration::from_secs(120))
    }

    /// Third-party APIs (push, email, payment providers)
    #[must_use]
    pub fn external_service() -> Self {
        Self::preset(3, 2, Duration::from_secs(300))
    }

    /// Derive a configuration from the dependency name.
    ///
    /// Returns `None` when the name matches no known category.
    #[must_use]
    pub fn for_dependency(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if has(&["redis", "cache", "memcache"]) {
            Some(Self::cache())
        } else if has(&["database", "postgres", "mysql", "sqlite", "db"]) {
            Some(Self::database())
        } else if has(&["storage", "s3", "minio", "blob"]) {
            Some(Self::storage())
        } else if has(&["external", "api", "push", "email", "sms", "webhook"]) {
            Some(Self::external_service())
        } else {
            None
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Perturb delays by up to +/-25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Graceful degradation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Run fallbacks when a primary fails
    pub fallback_enabled: bool,
    /// Hard deadline for any fallback
    #[serde(with = "humantime_serde")]
    pub fallback_timeout: Duration,
    /// How long a cached storage listing stays usable as a fallback
    #[serde(with = "humantime_serde")]
    pub cached_listing_ttl: Duration,
    /// Maximum notifications held for deferred delivery
    pub deferred_queue_capacity: usize,
    /// Poll interval suggested to clients when live updates are down
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            fallback_timeout: Duration::from_secs(5),
            cached_listing_ttl: Duration::from_secs(600),
            deferred_queue_capacity: 1000,
            polling_interval: Duration::from_secs(30),
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the background sampler and evaluator
    pub enabled: bool,
    /// Metrics sampling interval
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Degradation evaluation interval
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Samples retained in history
    pub history_capacity: usize,
    /// Memory utilization the emergency eviction aims for
    pub eviction_target_percent: f64,
    /// Escalation and recovery thresholds
    pub thresholds: ResourceThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: Duration::from_secs(10),
            evaluation_interval: Duration::from_secs(30),
            history_capacity: 100,
            eviction_target_percent: 60.0,
            thresholds: ResourceThresholds::default(),
        }
    }
}

/// Durations as `"250ms"`, `"30s"`, `"5m"` or bare seconds
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    /// Whole seconds render as `"Ns"`, anything finer as `"Nms"`.
    ///
    /// # Errors
    ///
    /// Propagates the serializer's error.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let text = if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&text)
    }

    /// # Errors
    ///
    /// Fails on an unknown unit or a non-integer amount.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(raw.trim()).ok_or_else(|| D::Error::custom(format!("invalid duration '{raw}'")))
    }

    fn parse(text: &str) -> Option<Duration> {
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (amount, unit) = text.split_at(split);
        let amount: u64 = amount.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(amount)),
            "" | "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            _ => None,
        }
    }
}
