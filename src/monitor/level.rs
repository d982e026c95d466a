//! Degradation levels, thresholds and the level evaluation rule

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional analytics collection
pub const FEATURE_ANALYTICS: &str = "analytics";
/// Verbose request logging
pub const FEATURE_DETAILED_LOGGING: &str = "detailed-logging";
/// Recommendation computation
pub const FEATURE_RECOMMENDATIONS: &str = "recommendations";
/// Low-priority background jobs
pub const FEATURE_BACKGROUND_JOBS: &str = "background-jobs-low-priority";
/// Proactive cache warming
pub const FEATURE_CACHE_WARMING: &str = "cache-warming";
/// Upload and media processing
pub const FEATURE_FILE_PROCESSING: &str = "file-processing";

const LIGHT_FEATURES: &[&str] = &[FEATURE_ANALYTICS, FEATURE_DETAILED_LOGGING];
const MODERATE_FEATURES: &[&str] = &[
    FEATURE_ANALYTICS,
    FEATURE_DETAILED_LOGGING,
    FEATURE_RECOMMENDATIONS,
];
const SEVERE_FEATURES: &[&str] = &[
    FEATURE_ANALYTICS,
    FEATURE_DETAILED_LOGGING,
    FEATURE_RECOMMENDATIONS,
    FEATURE_BACKGROUND_JOBS,
    FEATURE_CACHE_WARMING,
    FEATURE_FILE_PROCESSING,
];

/// How much optional work is being shed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DegradationLevel {
    /// Everything enabled
    #[default]
    None,
    /// Analytics and detailed logging off
    Light,
    /// Recommendations off as well
    Moderate,
    /// Background work off, emergency cache eviction
    Severe,
}

impl DegradationLevel {
    /// 0 for `None` through 3 for `Severe`
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Light => 1,
            Self::Moderate => 2,
            Self::Severe => 3,
        }
    }

    /// Features switched off while this level is in effect (cumulative)
    #[must_use]
    pub fn disabled_features(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Light => LIGHT_FEATURES,
            Self::Moderate => MODERATE_FEATURES,
            Self::Severe => SEVERE_FEATURES,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Light => write!(f, "light"),
            Self::Moderate => write!(f, "moderate"),
            Self::Severe => write!(f, "severe"),
        }
    }
}

/// CPU and memory utilization thresholds, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// LIGHT at or above this CPU
    pub warning_cpu: f64,
    /// LIGHT at or above this memory
    pub warning_memory: f64,
    /// MODERATE at or above this CPU alone
    pub moderate_cpu: f64,
    /// MODERATE at or above this memory alone
    pub moderate_memory: f64,
    /// SEVERE at or above this CPU
    pub critical_cpu: f64,
    /// SEVERE at or above this memory
    pub critical_memory: f64,
    /// NONE requires CPU below this
    pub recovery_cpu: f64,
    /// NONE requires memory below this
    pub recovery_memory: f64,
    /// Disk usage that raises an alert
    pub warning_disk: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            warning_cpu: 70.0,
            warning_memory: 75.0,
            moderate_cpu: 80.0,
            moderate_memory: 85.0,
            critical_cpu: 85.0,
            critical_memory: 90.0,
            recovery_cpu: 60.0,
            recovery_memory: 65.0,
            warning_disk: 90.0,
        }
    }
}

impl ResourceThresholds {
    /// Check ordering `recovery < warning <= moderate <= critical <= 100`.
    ///
    /// # Errors
    ///
    /// Returns a description of every violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        for (resource, recovery, warning, moderate, critical) in [
            (
                "cpu",
                self.recovery_cpu,
                self.warning_cpu,
                self.moderate_cpu,
                self.critical_cpu,
            ),
            (
                "memory",
                self.recovery_memory,
                self.warning_memory,
                self.moderate_memory,
                self.critical_memory,
            ),
        ] {
            if !(0.0..=100.0).contains(&recovery) || !(0.0..=100.0).contains(&critical) {
                problems.push(format!("{resource} thresholds must be between 0 and 100"));
            }
            if recovery >= warning {
                problems.push(format!(
                    "recovery_{resource} ({recovery}) must be below warning_{resource} ({warning})"
                ));
            }
            if warning > moderate {
                problems.push(format!(
                    "warning_{resource} ({warning}) must not exceed moderate_{resource} ({moderate})"
                ));
            }
            if moderate > critical {
                problems.push(format!(
                    "moderate_{resource} ({moderate}) must not exceed critical_{resource} ({critical})"
                ));
            }
        }
        if !(0.0..=100.0).contains(&self.warning_disk) {
            problems.push("warning_disk must be between 0 and 100".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// Level implied by a CPU/memory sample.
///
/// Rules are checked in order; a sample between the recovery and warning
/// thresholds keeps `current` unchanged.
#[must_use]
pub fn evaluate_level(
    current: DegradationLevel,
    cpu: f64,
    memory: f64,
    t: &ResourceThresholds,
) -> DegradationLevel {
    if cpu >= t.critical_cpu || memory >= t.critical_memory {
        DegradationLevel::Severe
    } else if (cpu >= t.warning_cpu && memory >= t.warning_memory)
        || cpu >= t.moderate_cpu
        || memory >= t.moderate_memory
    {
        DegradationLevel::Moderate
    } else if cpu >= t.warning_cpu || memory >= t.warning_memory {
        DegradationLevel::Light
    } else if cpu < t.recovery_cpu && memory < t.recovery_memory {
        DegradationLevel::None
    } else {
        current
    }
}

/// Process-wide degradation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradationState {
    /// Any level other than `None` is in effect
    pub is_active: bool,
    /// Current level
    pub level: DegradationLevel,
    /// When degradation began (kept across level changes)
    pub activated_at: Option<DateTime<Utc>>,
    /// Why the current level was entered
    pub reason: Option<String>,
    /// Features switched off by the current level
    pub disabled_features: BTreeSet<String>,
    /// Dependencies unhealthy when the level was entered
    pub affected_services: BTreeSet<String>,
}
