//! Orchestration layer: scheduling, per-task execution and repair.
//!
//! The scheduler drives a task graph under the governor's budget, the
//! wrapper guards each task, and the repair orchestrator escalates through
//! the strategy ladder when verification fails. The pipeline ties the
//! three together.

pub mod pipeline;
pub mod repair;
pub mod rewrite;
pub mod scheduler;
pub mod wrapper;

pub use pipeline::{Pipeline, PipelineReport};
pub use repair::{
    extract_failing_files, AttemptVerdict, RepairAttempt, RepairOrchestrator, RepairRequest,
    RepairResult, RepairSession, RepairState, RepairStrategy, StrategyBackend, Verdict,
    VerificationGate,
};
pub use rewrite::{DirWorkspace, Rewrite, RewritePlan, Workspace};
pub use scheduler::{RunReport, RunResult, Scheduler, SchedulerEvent, SchedulerState};
pub use wrapper::{ContextProvider, ExecutionWrapper, ResourceFootprint, TaskExecutor, TaskOutcome};

pub use crate::shell::{CommandGate, CommandStrategy, ShellExecutor};
