//! Scheduler for budgeted parallel task execution.
//!
//! The Scheduler drives a [`DependencyTracker`] to completion. Each tick it
//! asks the governor for a budget, dispatches as many ready tasks as the
//! budget leaves room for, then waits for at least one in-flight task to
//! finish before looking again. Tasks are only turned into futures when they
//! are dispatched, never up front.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::graph::TaskGraph;
use crate::core::task::{Artifact, TaskError, TaskId, TaskStatus};
use crate::core::tracker::DependencyTracker;
use crate::error::{Error, Result};
use crate::orchestration::wrapper::{ExecutionWrapper, TaskOutcome};
use crate::resource::governor::{ConcurrencyBudget, ConcurrencyGovernor};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scheduling,
    /// No new dispatches; waiting for in-flight tasks to report.
    Draining,
    Terminal,
}

/// Final verdict of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum RunResult {
    AllTasksSucceeded,
    /// Failed tasks, direct and by dependency, in graph insertion order.
    PartialFailure { failed: Vec<TaskId> },
}

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These let external observers follow a run without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        duration: Duration,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    /// A task hit resource exhaustion and went back to the ready set.
    TaskRequeued {
        task_id: TaskId,
    },
    BudgetChanged {
        budget: ConcurrencyBudget,
    },
    /// The run switched to one task at a time for its remainder.
    SequentialMode,
    RunFinished {
        result: RunResult,
    },
}

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: RunResult,
    pub statuses: Vec<(TaskId, TaskStatus)>,
    /// One entry per execution attempt, in completion order.
    pub outcomes: Vec<TaskOutcome>,
    /// Highest number of tasks that were running at the same time.
    pub peak_running: usize,
    pub sequential: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.result == RunResult::AllTasksSucceeded
    }

    pub fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.statuses
            .iter()
            .find(|(tid, _)| tid == id)
            .map(|(_, status)| status)
    }

    /// Artifacts of successful attempts, in completion order.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.outcomes
            .iter()
            .flat_map(|o| o.artifacts().iter().cloned())
            .collect()
    }
}

/// Executes a task graph under a concurrency budget.
///
/// # Example
///
/// ```ignore
/// let graph = TaskGraph::from_plan(PlanDocument::load(path)?)?;
/// let governor = ConcurrencyGovernor::new(config.governor, monitor.clone());
/// let wrapper = ExecutionWrapper::new(executor, monitor, config.wrapper);
///
/// let mut scheduler = Scheduler::new(graph, governor, wrapper);
/// let report = scheduler.run().await?;
/// ```
pub struct Scheduler {
    tracker: DependencyTracker,
    governor: ConcurrencyGovernor,
    wrapper: ExecutionWrapper,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    state: SchedulerState,
    /// Tasks that already used their one resource-exhaustion retry.
    exhausted: HashSet<TaskId>,
    last_budget: Option<ConcurrencyBudget>,
    peak_running: usize,
    outcomes: Vec<TaskOutcome>,
}

impl Scheduler {
    pub fn new(graph: TaskGraph, governor: ConcurrencyGovernor, wrapper: ExecutionWrapper) -> Self {
        Self {
            tracker: DependencyTracker::new(graph),
            governor,
            wrapper,
            event_tx: None,
            state: SchedulerState::Idle,
            exhausted: HashSet::new(),
            last_budget: None,
            peak_running: 0,
            outcomes: Vec::new(),
        }
    }

    /// Emit [`SchedulerEvent`]s on `tx`. Events are dropped rather than
    /// stalling the run when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    /// Run every task to a terminal status.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Run until every task is terminal or `cancel` fires.
    ///
    /// After cancellation nothing new is dispatched, in-flight tasks are
    /// allowed to finish and report, and unstarted tasks end as
    /// [`TaskError::Cancelled`]. Task failures never surface as `Err`; only a
    /// broken internal transition does.
    pub async fn run_until_cancelled(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        if self.state != SchedulerState::Idle {
            return Err(Error::Validation("scheduler has already run".into()));
        }
        let started = Instant::now();
        self.state = SchedulerState::Scheduling;
        info!(tasks = self.tracker.graph().len(), "scheduler run started");

        let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                self.state = SchedulerState::Draining;
                warn!(in_flight = running.len(), "run cancelled, draining");
            }
            if cancelled {
                let dropped = self.tracker.cancel_unstarted();
                for task_id in dropped {
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id,
                        error: TaskError::Cancelled,
                    });
                }
            }

            let ready = self.tracker.ready_set();
            if ready.is_empty() && running.is_empty() {
                if !self.tracker.is_complete() {
                    self.fail_stuck()?;
                }
                break;
            }

            if !ready.is_empty() {
                let budget = self.governor.budget_for_tick();
                self.note_budget(budget);
                let slots = budget.get().saturating_sub(running.len());
                for task_id in ready.into_iter().take(slots) {
                    if !self.dispatch(&task_id, &mut in_flight, &mut running)? {
                        break;
                    }
                }
            }

            if running.is_empty() {
                continue;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled(), if !cancelled => continue,
                joined = in_flight.join_next_with_id() => joined,
            };
            match joined {
                Some(Ok((handle, outcome))) => {
                    running.remove(&handle);
                    self.record(outcome)?;
                }
                Some(Err(join_err)) => {
                    let Some(task_id) = running.remove(&join_err.id()) else {
                        continue;
                    };
                    error!(task = %task_id, error = %join_err, "task worker died");
                    self.fail(
                        &task_id,
                        TaskError::Panicked {
                            message: join_err.to_string(),
                        },
                    )?;
                }
                None => running.clear(),
            }
        }

        self.state = SchedulerState::Terminal;
        let failed = self.tracker.failed();
        let result = if failed.is_empty() {
            RunResult::AllTasksSucceeded
        } else {
            RunResult::PartialFailure { failed }
        };
        match &result {
            RunResult::AllTasksSucceeded => info!("all tasks succeeded"),
            RunResult::PartialFailure { failed } => {
                warn!(failed = failed.len(), "run finished with failures")
            }
        }
        self.emit(SchedulerEvent::RunFinished {
            result: result.clone(),
        });

        Ok(RunReport {
            result,
            statuses: self.tracker.statuses(),
            outcomes: std::mem::take(&mut self.outcomes),
            peak_running: self.peak_running,
            sequential: self.governor.is_sequential(),
            cancelled,
            elapsed: started.elapsed(),
        })
    }

    /// Start one ready task. Returns false when dispatch should stop for
    /// this tick.
    fn dispatch(
        &mut self,
        task_id: &TaskId,
        in_flight: &mut JoinSet<TaskOutcome>,
        running: &mut HashMap<tokio::task::Id, TaskId>,
    ) -> Result<bool> {
        if let Err(e) = running.try_reserve(1) {
            self.exhausted_at_dispatch(task_id, &e.to_string())?;
            return Ok(false);
        }
        let Some(node) = self.tracker.node(task_id).cloned() else {
            return Err(Error::Validation(format!("task '{}' not found in graph", task_id)));
        };

        self.tracker.mark_running(task_id)?;
        let wrapper = self.wrapper.clone();
        let handle = in_flight.spawn(async move { wrapper.run(&node).await });
        running.insert(handle.id(), task_id.clone());
        self.peak_running = self.peak_running.max(running.len());

        debug!(task = %task_id, running = running.len(), "task dispatched");
        self.emit(SchedulerEvent::TaskStarted {
            task_id: task_id.clone(),
        });
        Ok(true)
    }

    fn record(&mut self, outcome: TaskOutcome) -> Result<()> {
        let task_id = outcome.task_id.clone();
        match &outcome.result {
            Ok(_) => {
                let unlocked = self.tracker.mark_done(&task_id)?;
                debug!(task = %task_id, unlocked = unlocked.len(), "task done");
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id,
                    duration: outcome.duration,
                });
            }
            Err(TaskError::ResourceExhausted { message }) if !self.exhausted.contains(&task_id) => {
                warn!(task = %task_id, %message, "resource exhaustion, requeueing");
                self.exhausted.insert(task_id.clone());
                self.tracker.requeue(&task_id)?;
                self.emit(SchedulerEvent::TaskRequeued { task_id });
                self.enter_sequential();
            }
            Err(e) => {
                let e = e.clone();
                self.fail(&task_id, e)?;
            }
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    /// Bookkeeping for a new dispatch could not be allocated.
    fn exhausted_at_dispatch(&mut self, task_id: &TaskId, message: &str) -> Result<()> {
        if self.exhausted.insert(task_id.clone()) {
            warn!(task = %task_id, %message, "allocation failed at dispatch");
            self.enter_sequential();
            Ok(())
        } else {
            self.fail(task_id, TaskError::resource_exhausted(message))
        }
    }

    fn fail(&mut self, task_id: &TaskId, error: TaskError) -> Result<()> {
        warn!(task = %task_id, error = %error, "task failed");
        let propagated = self.tracker.mark_failed(task_id, error.clone())?;
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task_id.clone(),
            error,
        });
        for downstream in propagated {
            self.emit(SchedulerEvent::TaskFailed {
                task_id: downstream,
                error: TaskError::DependencyFailed {
                    upstream: task_id.clone(),
                },
            });
        }
        Ok(())
    }

    /// Nothing is ready, nothing is running, yet the graph is not complete.
    /// Close out the remainder instead of spinning.
    fn fail_stuck(&mut self) -> Result<()> {
        let stuck = self.tracker.unstarted();
        error!(tasks = stuck.len(), "no runnable task and none in flight, failing remainder");
        for task_id in stuck {
            if self
                .tracker
                .status(&task_id)
                .is_some_and(|s| !s.is_terminal())
            {
                self.fail(&task_id, TaskError::execution("no path to completion"))?;
            }
        }
        Ok(())
    }

    fn enter_sequential(&mut self) {
        if !self.governor.is_sequential() {
            self.governor.force_sequential();
            self.emit(SchedulerEvent::SequentialMode);
        }
    }

    fn note_budget(&mut self, budget: ConcurrencyBudget) {
        if self.last_budget != Some(budget) {
            self.last_budget = Some(budget);
            debug!(%budget, "budget for tick");
            self.emit(SchedulerEvent::BudgetChanged { budget });
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "scheduler event dropped");
            }
        }
    }
}
