//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work handed to executors. The node itself
//! is immutable once the graph is built; its lifecycle status is owned by
//! the [`DependencyTracker`](crate::core::tracker::DependencyTracker).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Identifier for a task, as assigned by the plan that produced the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a single task attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskError {
    /// The executor returned an error.
    #[error("execution failed: {message}")]
    Execution { message: String },
    /// The executor did not finish within the per-task timeout.
    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    /// The executor panicked.
    #[error("executor panicked: {message}")]
    Panicked { message: String },
    /// The host could not provide memory for the task.
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },
    /// A (transitive) predecessor failed, so the task never ran.
    #[error("dependency {upstream} failed")]
    DependencyFailed { upstream: TaskId },
    /// The run was cancelled before the task was dispatched.
    #[error("cancelled before dispatch")]
    Cancelled,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Whether the failure originated upstream rather than in this task.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, TaskError::DependencyFailed { .. })
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on at least one predecessor.
    Pending,
    /// Every predecessor is done; eligible for dispatch.
    Ready,
    /// Handed to an executor.
    Running,
    /// Completed successfully.
    Done,
    /// Failed, either directly or through a failed predecessor.
    Failed { error: TaskError },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Check if the status is terminal (Done or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }

    /// Short lowercase label without failure detail.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            other => f.write_str(other.label()),
        }
    }
}

/// A single node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    /// Human-readable description, also used as the context lookup key.
    #[serde(default)]
    pub description: String,
    /// Ids of the tasks that must be done before this one may start.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// What the task must produce. Opaque to the scheduler.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskNode {
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            depends_on: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    /// Add a dependency on another task.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A file produced (or rewritten) by a task or repair strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the working directory.
    pub path: String,
    pub content: String,
}

impl Artifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}
