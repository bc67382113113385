//! Host resource sampling and the concurrency budget derived from it.

pub mod governor;
pub mod monitor;

pub use governor::{
    compute_budget, BudgetOverride, ConcurrencyBudget, ConcurrencyGovernor, PressureLevel,
};
pub use monitor::{ProcProbe, ResourceMonitor, ResourceProbe, ResourceSample, SamplingMonitor};
