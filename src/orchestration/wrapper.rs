//! Per-task execution guard.
//!
//! The wrapper sits between the scheduler and a [`TaskExecutor`]. It delays
//! a start under memory pressure (once, for a bounded time), gathers
//! auxiliary context, enforces the per-task timeout, and turns every way a
//! task can end, including a panic, into a [`TaskOutcome`]. Context calls
//! are bounded separately so a stuck provider cannot stall a task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WrapperConfig;
use crate::core::task::{Artifact, TaskError, TaskId, TaskNode};
use crate::resource::monitor::ResourceMonitor;

/// Performs the actual work of one task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &TaskNode,
        context: &[String],
    ) -> std::result::Result<Vec<Artifact>, TaskError>;
}

/// Retrieval over previously produced artifacts.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Up to `limit` snippets relevant to `query`.
    async fn retrieve(&self, query: &str, limit: usize) -> crate::Result<Vec<String>>;

    /// Offer a freshly produced artifact for future retrieval.
    async fn index(&self, _task: &TaskId, _artifact: &Artifact) -> crate::Result<()> {
        Ok(())
    }
}

/// Resource readings taken around one execution attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceFootprint {
    pub memory_percent_at_start: Option<f64>,
    pub memory_percent_at_end: Option<f64>,
    /// Whether the start was delayed by memory pressure.
    pub paused: bool,
}

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: std::result::Result<Vec<Artifact>, TaskError>,
    pub duration: Duration,
    pub footprint: ResourceFootprint,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn artifacts(&self) -> &[Artifact] {
        match &self.result {
            Ok(artifacts) => artifacts,
            Err(_) => &[],
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.result.as_ref().err()
    }
}

/// Guards a single task invocation. Cheap to clone; one clone per dispatch.
#[derive(Clone)]
pub struct ExecutionWrapper {
    executor: Arc<dyn TaskExecutor>,
    monitor: Arc<dyn ResourceMonitor>,
    context: Option<Arc<dyn ContextProvider>>,
    config: WrapperConfig,
}

impl ExecutionWrapper {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        monitor: Arc<dyn ResourceMonitor>,
        config: WrapperConfig,
    ) -> Self {
        Self {
            executor,
            monitor,
            context: None,
            config,
        }
    }

    pub fn with_context(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Run one attempt of `node`. Never panics and never returns an error:
    /// every failure is folded into the outcome.
    pub async fn run(&self, node: &TaskNode) -> TaskOutcome {
        let started = Instant::now();
        let mut footprint = ResourceFootprint::default();

        footprint.paused = self.wait_for_headroom(&node.id).await;
        footprint.memory_percent_at_start = self.memory_percent();

        let context = self.retrieve_context(node).await;
        let result = self.invoke(node, &context).await;

        if let Ok(artifacts) = &result {
            self.index_artifacts(&node.id, artifacts).await;
        }
        footprint.memory_percent_at_end = self.memory_percent();

        let duration = started.elapsed();
        match &result {
            Ok(artifacts) => {
                debug!(task = %node.id, ?duration, artifacts = artifacts.len(), "task finished")
            }
            Err(e) => debug!(task = %node.id, ?duration, error = %e, "task failed"),
        }

        TaskOutcome {
            task_id: node.id.clone(),
            result,
            duration,
            footprint,
        }
    }

    /// Pause once if memory is above the high-water mark, then re-check once.
    /// Proceeds regardless of the second reading. Returns whether it paused.
    async fn wait_for_headroom(&self, task: &TaskId) -> bool {
        let high_water = self.config.high_water_percent;
        let Some(percent) = self.memory_percent() else {
            return false;
        };
        if percent <= high_water {
            return false;
        }

        let pause = self.config.pressure_pause();
        warn!(task = %task, memory_percent = percent, ?pause, "memory above high-water mark");
        tokio::time::sleep(pause).await;

        if let Some(after) = self.memory_percent() {
            if after > high_water {
                warn!(task = %task, memory_percent = after, "still under pressure, starting");
            }
        }
        true
    }

    fn memory_percent(&self) -> Option<f64> {
        self.monitor.sample().ok().map(|s| s.memory_percent())
    }

    async fn retrieve_context(&self, node: &TaskNode) -> Vec<String> {
        let Some(provider) = &self.context else {
            return Vec::new();
        };
        let limit = self.config.context_limit;
        if limit == 0 {
            return Vec::new();
        }
        let query = if node.description.is_empty() {
            node.id.as_str()
        } else {
            node.description.as_str()
        };
        let bound = self.config.context_timeout();
        match tokio::time::timeout(bound, provider.retrieve(query, limit)).await {
            Ok(Ok(mut snippets)) => {
                snippets.truncate(limit);
                snippets
            }
            Ok(Err(e)) => {
                warn!(task = %node.id, error = %e, "context retrieval failed, continuing without");
                Vec::new()
            }
            Err(_) => {
                warn!(task = %node.id, ?bound, "context retrieval timed out, continuing without");
                Vec::new()
            }
        }
    }

    async fn invoke(
        &self,
        node: &TaskNode,
        context: &[String],
    ) -> std::result::Result<Vec<Artifact>, TaskError> {
        let call = AssertUnwindSafe(self.executor.execute(node, context)).catch_unwind();
        let limit = self.config.task_timeout();

        let caught = if limit.is_zero() {
            call.await
        } else {
            match tokio::time::timeout(limit, call).await {
                Ok(caught) => caught,
                Err(_) => return Err(TaskError::Timeout { elapsed: limit }),
            }
        };

        caught.unwrap_or_else(|payload| {
            Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        })
    }

    async fn index_artifacts(&self, task: &TaskId, artifacts: &[Artifact]) {
        let Some(provider) = &self.context else {
            return;
        };
        let bound = self.config.context_timeout();
        for artifact in artifacts {
            match tokio::time::timeout(bound, provider.index(task, artifact)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task = %task, path = %artifact.path, error = %e, "indexing failed")
                }
                Err(_) => {
                    warn!(task = %task, path = %artifact.path, ?bound, "indexing timed out")
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
