//! Feature flag registry consulted by optional code paths

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::failsafe::deadline_after;

static GLOBAL: LazyLock<Arc<FeatureFlags>> = LazyLock::new(|| Arc::new(FeatureFlags::new()));

#[derive(Debug, Clone, Copy)]
struct Flag {
    enabled: bool,
    /// Value to restore once a temporary disable lapses
    restore: Option<(Instant, bool)>,
}

impl Flag {
    /// Apply a lapsed temporary disable; returns true if the flag changed
    fn expire(&mut self, now: Instant) -> bool {
        match self.restore {
            Some((until, previous)) if now >= until => {
                self.enabled = previous;
                self.restore = None;
                true
            }
            _ => false,
        }
    }
}

/// Name to boolean map; unknown names are enabled.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    flags: DashMap<String, Flag>,
}

impl FeatureFlags {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Whether `name` is enabled
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        let Some(mut flag) = self.flags.get_mut(name) else {
            return true;
        };
        if flag.expire(Instant::now()) {
            debug!(feature = %name, enabled = flag.enabled, "Temporary disable expired");
        }
        flag.enabled
    }

    /// Set a flag, cancelling any temporary disable
    pub fn set_flag(&self, name: &str, enabled: bool) {
        let previous = self.flags.insert(
            name.to_string(),
            Flag {
                enabled,
                restore: None,
            },
        );
        if previous.is_none_or(|p| p.enabled != enabled) {
            info!(feature = %name, enabled, "Feature flag changed");
        }
    }

    /// Disable `name` for `duration`, then restore its prior value
    pub fn disable_temporarily(&self, name: &str, duration: Duration) {
        let now = Instant::now();
        let mut entry = self.flags.entry(name.to_string()).or_insert(Flag {
            enabled: true,
            restore: None,
        });
        entry.expire(now);
        let previous = entry
            .restore
            .map_or(entry.enabled, |(_, previous)| previous);
        entry.enabled = false;
        entry.restore = Some((deadline_after(now, duration), previous));
        info!(
            feature = %name,
            duration_ms = duration.as_millis(),
            "Feature temporarily disabled"
        );
    }

    /// Enable every known flag
    pub fn enable_all(&self) {
        for mut flag in self.flags.iter_mut() {
            flag.enabled = true;
            flag.restore = None;
        }
        info!("All features enabled");
    }

    /// Current value of every known flag
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        let now = Instant::now();
        self.flags
            .iter_mut()
            .map(|mut flag| {
                flag.expire(now);
                (flag.key().clone(), flag.enabled)
            })
            .collect()
    }

    /// Run `work` only if `name` is enabled
    pub async fn run_optional<F, T>(&self, name: &str, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.is_enabled(name) {
            Some(work.await)
        } else {
            warn!(
                feature = %name,
                kind = "ResourceDegradedWarning",
                "Skipping optional work while degraded"
            );
            None
        }
    }
}
