//! Concurrency governor.
//!
//! Converts a resource sample (plus an optional operator override) into the
//! number of tasks allowed to run at once. The governor is the single owner
//! of that number; the scheduler asks for it once per tick and treats the
//! answer as fixed until the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::resource::monitor::{ResourceMonitor, ResourceSample};
use crate::Error;

/// Percent of CPU or memory at which the host is considered under pressure.
pub const WARNING_PERCENT: f64 = 75.0;
/// Percent of CPU or memory at which the host is considered critical.
pub const CRITICAL_PERCENT: f64 = 90.0;

/// Maximum number of tasks allowed to run simultaneously. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConcurrencyBudget(usize);

impl ConcurrencyBudget {
    /// Fully sequential execution.
    pub const SEQUENTIAL: ConcurrencyBudget = ConcurrencyBudget(1);

    /// Clamp `value` into `[1, ceiling]`.
    pub fn clamped(value: usize, ceiling: usize) -> Self {
        Self(value.clamp(1, ceiling.max(1)))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ConcurrencyBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator override for the budget: automatic or a fixed worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RawOverride", into = "RawOverride")]
pub enum BudgetOverride {
    #[default]
    Auto,
    Fixed(usize),
}

impl BudgetOverride {
    /// Parse `"auto"` or a positive integer. Anything else resolves to
    /// [`BudgetOverride::Auto`] with a warning.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Self::Auto;
        }
        match trimmed.parse::<usize>() {
            Ok(n) if n > 0 => Self::Fixed(n),
            _ => {
                warn!(value = %trimmed, "invalid concurrency override, using auto");
                Self::Auto
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawOverride {
    Number(i64),
    Text(String),
}

impl From<RawOverride> for BudgetOverride {
    fn from(raw: RawOverride) -> Self {
        match raw {
            RawOverride::Number(n) if n > 0 => BudgetOverride::Fixed(n as usize),
            RawOverride::Number(n) => BudgetOverride::parse(&n.to_string()),
            RawOverride::Text(s) => BudgetOverride::parse(&s),
        }
    }
}

impl From<BudgetOverride> for RawOverride {
    fn from(value: BudgetOverride) -> Self {
        match value {
            BudgetOverride::Auto => RawOverride::Text("auto".to_string()),
            BudgetOverride::Fixed(n) => RawOverride::Number(n as i64),
        }
    }
}

/// Coarse classification of host load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Optimal,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn classify(sample: &ResourceSample) -> Self {
        let peak = sample.cpu_percent().max(sample.memory_percent());
        if peak >= CRITICAL_PERCENT {
            PressureLevel::Critical
        } else if peak >= WARNING_PERCENT {
            PressureLevel::Warning
        } else {
            PressureLevel::Optimal
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureLevel::Optimal => write!(f, "optimal"),
            PressureLevel::Warning => write!(f, "warning"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Compute a budget from a sample (or a monitor failure) and an override.
///
/// - A fixed override is clamped to `[1, ceiling]`.
/// - Otherwise `floor(available_gb / memory_per_task_gb)` is clamped to
///   `[1, ceiling]`.
/// - A failed sample yields a sequential budget.
pub fn compute_budget(
    sample: Result<&ResourceSample, &Error>,
    budget_override: BudgetOverride,
    config: &GovernorConfig,
) -> ConcurrencyBudget {
    if let BudgetOverride::Fixed(n) = budget_override {
        return ConcurrencyBudget::clamped(n, config.ceiling);
    }
    match sample {
        Ok(sample) => {
            let per_task = config.memory_per_task_gb;
            if !(per_task > 0.0) {
                return ConcurrencyBudget::SEQUENTIAL;
            }
            let slots = (sample.available_memory_gb() / per_task).floor();
            ConcurrencyBudget::clamped(slots.max(0.0) as usize, config.ceiling)
        }
        Err(e) => {
            warn!(error = %e, "resource monitor failed, falling back to sequential budget");
            ConcurrencyBudget::SEQUENTIAL
        }
    }
}

/// Owner of the current [`ConcurrencyBudget`].
pub struct ConcurrencyGovernor {
    config: GovernorConfig,
    monitor: Arc<dyn ResourceMonitor>,
    cached: Option<(ConcurrencyBudget, Instant)>,
    sequential: bool,
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig, monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self {
            config,
            monitor,
            cached: None,
            sequential: false,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Budget for the current scheduling tick.
    ///
    /// Automatic budgets are recomputed at most once per refresh interval;
    /// ticks inside the interval reuse the previous answer.
    pub fn budget_for_tick(&mut self) -> ConcurrencyBudget {
        if self.sequential {
            return ConcurrencyBudget::SEQUENTIAL;
        }
        if let BudgetOverride::Fixed(n) = self.config.concurrency {
            return ConcurrencyBudget::clamped(n, self.config.ceiling);
        }
        if let Some((budget, at)) = self.cached {
            if at.elapsed() < self.refresh_interval() {
                return budget;
            }
        }

        let sample = self.monitor.sample();
        if let Ok(sample) = &sample {
            debug!(
                pressure = %PressureLevel::classify(sample),
                available_gb = sample.available_memory_gb(),
                cpu_percent = sample.cpu_percent(),
                "resource sample for budget"
            );
        }
        let budget = compute_budget(
            sample.as_ref(),
            self.config.concurrency,
            &self.config,
        );
        if self.cached.map(|(prev, _)| prev) != Some(budget) {
            info!(%budget, "concurrency budget updated");
        }
        self.cached = Some((budget, Instant::now()));
        budget
    }

    /// Pin the budget to 1 for the rest of this governor's life.
    pub fn force_sequential(&mut self) {
        if !self.sequential {
            warn!("forcing sequential execution");
        }
        self.sequential = true;
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval()
    }
}
