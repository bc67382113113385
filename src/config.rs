use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::resource::governor::BudgetOverride;
use crate::{Error, Result};

pub const ENV_MAX_CONCURRENT_TASKS: &str = "SWARM_MAX_CONCURRENT_TASKS";
pub const ENV_MEMORY_PER_TASK_GB: &str = "SWARM_MEMORY_PER_TASK_GB";
pub const ENV_CONCURRENCY_CEILING: &str = "SWARM_CONCURRENCY_CEILING";
pub const ENV_MEMORY_HIGH_WATER: &str = "SWARM_MEMORY_HIGH_WATER";
pub const ENV_MAX_REPAIR_ATTEMPTS: &str = "SWARM_MAX_REPAIR_ATTEMPTS";
pub const ENV_TASK_TIMEOUT_SECS: &str = "SWARM_TASK_TIMEOUT_SECS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub wrapper: WrapperConfig,
    #[serde(default)]
    pub repair: RepairConfig,
}

/// Inputs to the concurrency budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub concurrency: BudgetOverride,
    pub memory_per_task_gb: f64,
    pub ceiling: usize,
    pub refresh_interval_ms: u64,
}

impl GovernorConfig {
    pub const DEFAULT_MEMORY_PER_TASK_GB: f64 = 1.5;
    pub const DEFAULT_CEILING: usize = 8;
    pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 2000;

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            concurrency: BudgetOverride::Auto,
            memory_per_task_gb: Self::DEFAULT_MEMORY_PER_TASK_GB,
            ceiling: Self::DEFAULT_CEILING,
            refresh_interval_ms: Self::DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl MonitorConfig {
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;
    pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 250;

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    /// Samples older than this are not trusted.
    pub fn stale_after(&self) -> Duration {
        (self.sample_interval() * 10).max(Duration::from_secs(5))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: Self::DEFAULT_SAMPLE_INTERVAL_MS,
            probe_timeout_ms: Self::DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    /// Memory use (percent) above which a task start is delayed.
    pub high_water_percent: f64,
    pub pressure_pause_ms: u64,
    /// Maximum number of context snippets requested per task.
    pub context_limit: usize,
    /// Bound on each context retrieval or index call.
    pub context_timeout_ms: u64,
    pub task_timeout_secs: u64,
}

impl WrapperConfig {
    pub const DEFAULT_HIGH_WATER_PERCENT: f64 = 85.0;
    pub const DEFAULT_PRESSURE_PAUSE_MS: u64 = 3000;
    pub const DEFAULT_CONTEXT_LIMIT: usize = 5;
    pub const DEFAULT_CONTEXT_TIMEOUT_MS: u64 = 5000;
    pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

    pub fn pressure_pause(&self) -> Duration {
        Duration::from_millis(self.pressure_pause_ms)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            high_water_percent: Self::DEFAULT_HIGH_WATER_PERCENT,
            pressure_pause_ms: Self::DEFAULT_PRESSURE_PAUSE_MS,
            context_limit: Self::DEFAULT_CONTEXT_LIMIT,
            context_timeout_ms: Self::DEFAULT_CONTEXT_TIMEOUT_MS,
            task_timeout_secs: Self::DEFAULT_TASK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_attempts: usize,
    /// How many prior attempts a strategy gets to see.
    pub history_window: usize,
    /// Diagnostics are cut to this many characters before reaching a strategy.
    pub diagnostic_limit: usize,
}

impl RepairConfig {
    pub const DEFAULT_MAX_ATTEMPTS: usize = 7;
    pub const DEFAULT_HISTORY_WINDOW: usize = 3;
    pub const DEFAULT_DIAGNOSTIC_LIMIT: usize = 1500;
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            history_window: Self::DEFAULT_HISTORY_WINDOW,
            diagnostic_limit: Self::DEFAULT_DIAGNOSTIC_LIMIT,
        }
    }
}

impl Config {
    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("swarm.toml"))
    }

    /// Load from `~/.swarm/swarm.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(?config, "config loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let swarm_dir = Self::swarm_dir()?;
        if !swarm_dir.exists() {
            fs::create_dir_all(&swarm_dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let body = toml::to_string_pretty(self)
            .map_err(|e| Error::Validation(format!("cannot serialize config: {}", e)))?;
        fs::write(path, body)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply `SWARM_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparsable values are
    /// ignored with a warning, except the concurrency override which falls
    /// back to automatic.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_MAX_CONCURRENT_TASKS) {
            self.governor.concurrency = BudgetOverride::parse(&v);
        }
        if let Some(v) = parse_var(&lookup, ENV_MEMORY_PER_TASK_GB) {
            self.governor.memory_per_task_gb = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CONCURRENCY_CEILING) {
            self.governor.ceiling = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MEMORY_HIGH_WATER) {
            self.wrapper.high_water_percent = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_REPAIR_ATTEMPTS) {
            self.repair.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_TASK_TIMEOUT_SECS) {
            self.wrapper.task_timeout_secs = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.governor.ceiling == 0 {
            return Err(Error::Validation("governor.ceiling must be at least 1".into()));
        }
        if !(self.governor.memory_per_task_gb > 0.0) {
            return Err(Error::Validation(
                "governor.memory_per_task_gb must be positive".into(),
            ));
        }
        let hw = self.wrapper.high_water_percent;
        if !(hw > 0.0 && hw <= 100.0) {
            return Err(Error::Validation(format!(
                "wrapper.high_water_percent must be in (0, 100], got {}",
                hw
            )));
        }
        if self.repair.max_attempts == 0 {
            return Err(Error::Validation("repair.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}
