//! Resource metric samples, sample sources, and bounded history

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::{Error, Result};

/// CPU utilization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Global utilization across all cores (percent)
    pub usage_percent: f64,
    /// 1, 5 and 15 minute load averages (zero where unsupported)
    pub load_average: [f64; 3],
    /// Logical core count
    pub cores: usize,
}

/// Memory utilization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    /// Used / total (percent)
    pub usage_percent: f64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Bytes installed
    pub total_bytes: u64,
}

/// Disk utilization summed over mounted disks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    /// Used / total (percent)
    pub usage_percent: f64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Bytes available in total
    pub total_bytes: u64,
}

/// Process identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// Process id
    pub pid: u32,
    /// Seconds since the sampler was created
    pub uptime_secs: u64,
}

/// Point-in-time resource snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// CPU
    pub cpu: CpuMetrics,
    /// Memory
    pub memory: MemoryMetrics,
    /// Disk
    pub disk: DiskMetrics,
    /// Process
    pub process: ProcessMetrics,
}

impl ResourceMetrics {
    /// Sample carrying only CPU and memory utilization
    #[must_use]
    pub fn from_usage(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu: CpuMetrics {
                usage_percent: cpu_percent,
                ..CpuMetrics::default()
            },
            memory: MemoryMetrics {
                usage_percent: memory_percent,
                ..MemoryMetrics::default()
            },
            disk: DiskMetrics::default(),
            process: ProcessMetrics {
                pid: std::process::id(),
                uptime_secs: 0,
            },
        }
    }
}

/// Produces resource samples
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Take one sample
    async fn sample(&self) -> Result<ResourceMetrics>;
}

/// Samples the host through `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first
/// sample after construction reads close to zero. Refreshes run on the
/// blocking pool.
#[derive(Clone)]
pub struct SystemSampler {
    state: Arc<SamplerState>,
}

struct SamplerState {
    system: Mutex<System>,
    disks: Mutex<Disks>,
    started: Instant,
}

impl std::fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSampler")
            .field("started", &self.state.started)
            .finish_non_exhaustive()
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    /// Create a sampler, prime the CPU counters and list mounted disks
    #[must_use]
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            state: Arc::new(SamplerState {
                system: Mutex::new(system),
                disks: Mutex::new(Disks::new_with_refreshed_list()),
                started: Instant::now(),
            }),
        }
    }

    /// Minimum spacing between samples for a meaningful CPU reading
    #[must_use]
    pub fn min_interval() -> std::time::Duration {
        sysinfo::MINIMUM_CPU_UPDATE_INTERVAL
    }
}

impl SamplerState {
    fn collect(&self) -> ResourceMetrics {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let load = System::load_average();
            let cpu = CpuMetrics {
                usage_percent: f64::from(system.global_cpu_usage()),
                load_average: [load.one, load.five, load.fifteen],
                cores: system.cpus().len(),
            };
            let memory = MemoryMetrics {
                usage_percent: percent(system.used_memory(), system.total_memory()),
                used_bytes: system.used_memory(),
                total_bytes: system.total_memory(),
            };
            (cpu, memory)
        };

        let (total, available) = {
            let mut disks = self.disks.lock();
            disks.refresh();
            disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
                (
                    t.saturating_add(d.total_space()),
                    a.saturating_add(d.available_space()),
                )
            })
        };
        let used = total.saturating_sub(available);

        ResourceMetrics {
            timestamp: Utc::now(),
            cpu,
            memory,
            disk: DiskMetrics {
                usage_percent: percent(used, total),
                used_bytes: used,
                total_bytes: total,
            },
            process: ProcessMetrics {
                pid: std::process::id(),
                uptime_secs: self.started.elapsed().as_secs(),
            },
        }
    }
}

#[async_trait]
impl MetricsSource for SystemSampler {
    async fn sample(&self) -> Result<ResourceMetrics> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || state.collect())
            .await
            .map_err(|e| Error::Internal(format!("System sampler task failed: {e}")))
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Replays a fixed list of (cpu, memory) samples, repeating the last one
#[derive(Debug)]
pub struct ScriptedMetrics {
    samples: Mutex<VecDeque<(f64, f64)>>,
    last: Mutex<(f64, f64)>,
}

impl ScriptedMetrics {
    /// Create from (cpu percent, memory percent) pairs
    #[must_use]
    pub fn new(samples: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
            last: Mutex::new((0.0, 0.0)),
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn sample(&self) -> Result<ResourceMetrics> {
        let next = self.samples.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(sample) = next {
            *last = sample;
        }
        Ok(ResourceMetrics::from_usage(last.0, last.1))
    }
}

/// Fixed-capacity ring of recent samples; the oldest is dropped first
#[derive(Debug)]
pub struct MetricsHistory {
    samples: VecDeque<ResourceMetrics>,
    capacity: usize,
}

impl MetricsHistory {
    /// Create with room for `capacity` samples (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample
    pub fn push(&mut self, sample: ResourceMetrics) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples oldest first
    #[must_use]
    pub fn to_vec(&self) -> Vec<ResourceMetrics> {
        self.samples.iter().cloned().collect()
    }
}
