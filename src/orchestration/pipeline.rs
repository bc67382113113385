//! Construct, verify, repair.
//!
//! A [`Pipeline`] runs a task graph through the scheduler, writes what the
//! tasks produced into the workspace, asks the verification gate for a
//! verdict and, when it fails, hands the artifacts to the repair ladder.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::orchestration::repair::{RepairOrchestrator, RepairResult, Verdict};
use crate::orchestration::rewrite::Workspace;
use crate::orchestration::scheduler::{RunReport, Scheduler, SchedulerEvent};
use crate::orchestration::wrapper::{ContextProvider, ExecutionWrapper, TaskExecutor};
use crate::resource::governor::ConcurrencyGovernor;
use crate::resource::monitor::ResourceMonitor;
use crate::Result;

/// What happened across all three phases.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run: RunReport,
    /// Absent when the run did not finish cleanly and verification was skipped.
    /// A failing verdict without a repair means the artifacts could not be
    /// written.
    pub verdict: Option<Verdict>,
    /// Present only when the gate's first verdict failed.
    pub repair: Option<RepairResult>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        if !self.run.is_success() {
            return false;
        }
        match (&self.verdict, &self.repair) {
            (Some(v), _) if v.passed => true,
            (_, Some(repair)) => repair.is_resolved(),
            _ => false,
        }
    }
}

pub struct Pipeline {
    config: Config,
    monitor: Arc<dyn ResourceMonitor>,
    executor: Arc<dyn TaskExecutor>,
    context: Option<Arc<dyn ContextProvider>>,
    workspace: Arc<dyn Workspace>,
    repair: RepairOrchestrator,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        monitor: Arc<dyn ResourceMonitor>,
        executor: Arc<dyn TaskExecutor>,
        workspace: Arc<dyn Workspace>,
        repair: RepairOrchestrator,
    ) -> Self {
        Self {
            config,
            monitor,
            executor,
            context: None,
            workspace,
            repair,
            event_tx: None,
        }
    }

    pub fn with_context(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub async fn execute(
        &self,
        graph: TaskGraph,
        cancel: CancellationToken,
    ) -> Result<PipelineReport> {
        let run = self.construct(graph, cancel).await?;

        if !run.is_success() || run.cancelled {
            warn!("construction incomplete, skipping verification");
            return Ok(PipelineReport {
                run,
                verdict: None,
                repair: None,
            });
        }

        let artifacts = run.artifacts();
        let mut write_errors = Vec::new();
        for artifact in &artifacts {
            if let Err(e) = self.workspace.write(artifact).await {
                warn!(path = %artifact.path, error = %e, "could not write artifact");
                write_errors.push(format!("{}: {}", artifact.path, e));
            }
        }
        if !write_errors.is_empty() {
            let verdict = Verdict::fail(format!(
                "could not write artifacts:\n{}",
                write_errors.join("\n")
            ));
            return Ok(PipelineReport {
                run,
                verdict: Some(verdict),
                repair: None,
            });
        }
        info!(artifacts = artifacts.len(), "artifacts written, verifying");

        let verdict = match self.repair.gate().verify(self.workspace.root()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "verification gate errored, treating as failure");
                Verdict::fail(format!("verification gate error: {}", e))
            }
        };
        if verdict.passed {
            info!("verification passed");
            return Ok(PipelineReport {
                run,
                verdict: Some(verdict),
                repair: None,
            });
        }

        let repair = self
            .repair
            .repair(verdict.clone(), artifacts, self.workspace.as_ref())
            .await?;
        Ok(PipelineReport {
            run,
            verdict: Some(verdict),
            repair: Some(repair),
        })
    }

    async fn construct(&self, graph: TaskGraph, cancel: CancellationToken) -> Result<RunReport> {
        let governor = ConcurrencyGovernor::new(self.config.governor.clone(), self.monitor.clone());
        let mut wrapper = ExecutionWrapper::new(
            self.executor.clone(),
            self.monitor.clone(),
            self.config.wrapper.clone(),
        );
        if let Some(context) = &self.context {
            wrapper = wrapper.with_context(context.clone());
        }

        let mut scheduler = Scheduler::new(graph, governor, wrapper);
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_events(tx.clone());
        }
        scheduler.run_until_cancelled(cancel).await
    }
}
