//! Host resource sampling.
//!
//! A [`ResourceMonitor`] answers "how loaded is the host right now" without
//! ever blocking the caller. The production monitor, [`SamplingMonitor`],
//! reads a cached sample that a background actor refreshes; the probing
//! itself happens off the scheduler's control loop.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::actors::{ActorHandle, SamplerActor};
use crate::config::MonitorConfig;
use crate::{Error, Result};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A point-in-time reading of host pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Fraction of physical memory in use, `0.0..=1.0`.
    pub memory_used_fraction: f64,
    /// Fraction of CPU time busy since the previous reading, `0.0..=1.0`.
    pub cpu_used_fraction: f64,
    pub available_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(
        memory_used_fraction: f64,
        cpu_used_fraction: f64,
        available_memory_bytes: u64,
        total_memory_bytes: u64,
    ) -> Self {
        Self {
            memory_used_fraction: memory_used_fraction.clamp(0.0, 1.0),
            cpu_used_fraction: cpu_used_fraction.clamp(0.0, 1.0),
            available_memory_bytes,
            total_memory_bytes,
            taken_at: Utc::now(),
        }
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / BYTES_PER_GB
    }

    pub fn memory_percent(&self) -> f64 {
        self.memory_used_fraction * 100.0
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu_used_fraction * 100.0
    }

    /// Age of the sample relative to now. Clock skew reads as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.taken_at).to_std().unwrap_or_default()
    }
}

/// Non-blocking source of resource samples.
pub trait ResourceMonitor: Send + Sync {
    /// Return the most recent sample. Must not block or perform I/O.
    fn sample(&self) -> Result<ResourceSample>;
}

/// Something that can actually read host counters. May block.
pub trait ResourceProbe: Send + 'static {
    fn read(&mut self) -> Result<ResourceSample>;
}

/// What the sampler publishes: nothing yet, a sample, or a probe error.
pub type SampleSlot = Option<std::result::Result<ResourceSample, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Reads memory and CPU counters from procfs.
#[derive(Debug)]
pub struct ProcProbe {
    meminfo: PathBuf,
    stat: PathBuf,
    last_cpu: Option<CpuTimes>,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::with_paths("/proc/meminfo", "/proc/stat")
    }

    pub fn with_paths(meminfo: impl Into<PathBuf>, stat: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
            stat: stat.into(),
            last_cpu: None,
        }
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for ProcProbe {
    fn read(&mut self) -> Result<ResourceSample> {
        let meminfo = std::fs::read_to_string(&self.meminfo)
            .map_err(|e| Error::Monitor(format!("{}: {}", self.meminfo.display(), e)))?;
        let (total, available) = parse_meminfo(&meminfo)?;

        let stat = std::fs::read_to_string(&self.stat)
            .map_err(|e| Error::Monitor(format!("{}: {}", self.stat.display(), e)))?;
        let now = parse_cpu_times(&stat)?;
        let cpu = match self.last_cpu {
            Some(prev) if now.total > prev.total => {
                now.busy.saturating_sub(prev.busy) as f64 / (now.total - prev.total) as f64
            }
            _ if now.total > 0 => now.busy as f64 / now.total as f64,
            _ => 0.0,
        };
        self.last_cpu = Some(now);

        let used = if total == 0 {
            0.0
        } else {
            1.0 - available as f64 / total as f64
        };
        Ok(ResourceSample::new(used, cpu, available, total))
    }
}

/// Parse `(total, available)` bytes from `/proc/meminfo` content.
fn parse_meminfo(content: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut fallback = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kb * 1024;
        match key {
            "MemTotal:" => total = Some(bytes),
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" | "Buffers:" | "Cached:" => fallback += bytes,
            _ => {}
        }
    }

    let total = total.ok_or_else(|| Error::Monitor("MemTotal missing from meminfo".into()))?;
    Ok((total, available.unwrap_or(fallback).min(total)))
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_times(content: &str) -> Result<CpuTimes> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| Error::Monitor("aggregate cpu line missing from stat".into()))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return Err(Error::Monitor(format!("malformed cpu line: {}", line)));
    }
    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Monitor backed by a [`SamplerActor`].
///
/// `sample()` only reads the last published value, so it is O(1) and never
/// waits on the probe. Samples older than `stale_after` are reported as
/// errors rather than trusted.
pub struct SamplingMonitor {
    rx: watch::Receiver<SampleSlot>,
    stale_after: Duration,
    _actor: ActorHandle,
}

impl SamplingMonitor {
    /// Spawn a sampler over `probe`. Must be called inside a tokio runtime.
    pub fn spawn<P: ResourceProbe>(probe: P, config: &MonitorConfig) -> Self {
        let (tx, rx) = watch::channel(None);
        let actor = SamplerActor::new(probe, tx)
            .with_interval(config.sample_interval())
            .with_probe_timeout(config.probe_timeout())
            .spawn();
        Self {
            rx,
            stale_after: config.stale_after(),
            _actor: actor,
        }
    }

    /// Spawn a sampler and wait (bounded) for its first reading.
    pub async fn start<P: ResourceProbe>(probe: P, config: &MonitorConfig) -> Self {
        let monitor = Self::spawn(probe, config);
        let mut rx = monitor.rx.clone();
        let wait = config.probe_timeout() * 2;
        if tokio::time::timeout(wait, rx.changed()).await.is_err() {
            debug!(?wait, "no resource sample before start deadline");
        }
        monitor
    }

    /// Sampling monitor over procfs.
    pub async fn system(config: &MonitorConfig) -> Self {
        Self::start(ProcProbe::new(), config).await
    }
}

impl ResourceMonitor for SamplingMonitor {
    fn sample(&self) -> Result<ResourceSample> {
        let slot = self.rx.borrow().clone();
        match slot {
            None => Err(Error::Monitor("no sample available yet".to_string())),
            Some(Err(message)) => Err(Error::Monitor(message)),
            Some(Ok(sample)) => {
                let age = sample.age();
                if age > self.stale_after {
                    Err(Error::Monitor(format!("sample is stale ({:?} old)", age)))
                } else {
                    Ok(sample)
                }
            }
        }
    }
}
