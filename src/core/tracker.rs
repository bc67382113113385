//! Dependency tracking over a validated task graph.
//!
//! The tracker is the only owner of node statuses. Every transition goes
//! through one of its `mark_*` methods so failure propagation can never be
//! bypassed: when a task fails, every transitive successor is failed with
//! it instead of being left pending forever.

use crate::core::graph::TaskGraph;
use crate::core::task::{TaskError, TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::NodeIndex;
use std::collections::VecDeque;
use tracing::debug;

/// Tracks task statuses and answers "what can run now".
#[derive(Debug)]
pub struct DependencyTracker {
    graph: TaskGraph,
    statuses: Vec<TaskStatus>,
}

impl DependencyTracker {
    /// Start tracking a graph. Tasks without dependencies begin Ready.
    pub fn new(graph: TaskGraph) -> Self {
        let statuses = graph
            .indices()
            .map(|idx| {
                if graph.predecessors(idx).next().is_none() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Pending
                }
            })
            .collect();
        Self { graph, statuses }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.graph
            .node_index(id)
            .map(|idx| &self.statuses[idx.index()])
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.graph.get(id)
    }

    /// Tasks whose predecessors are all done and that have not started,
    /// in graph insertion order.
    pub fn ready_set(&self) -> Vec<TaskId> {
        self.ids_where(|status| matches!(status, TaskStatus::Ready))
    }

    /// Transition a ready task to running.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let idx = self.index_of(id)?;
        match self.statuses[idx.index()] {
            TaskStatus::Ready => {
                self.statuses[idx.index()] = TaskStatus::Running;
                Ok(())
            }
            ref other => Err(self.invalid(id, other, "running")),
        }
    }

    /// Return a running task to the ready set for another attempt.
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        let idx = self.index_of(id)?;
        match self.statuses[idx.index()] {
            TaskStatus::Running => {
                self.statuses[idx.index()] = TaskStatus::Ready;
                Ok(())
            }
            ref other => Err(self.invalid(id, other, "ready")),
        }
    }

    /// Mark a running task done.
    ///
    /// Returns the successors that became ready as a result.
    pub fn mark_done(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let idx = self.index_of(id)?;
        match self.statuses[idx.index()] {
            TaskStatus::Running => {}
            ref other => return Err(self.invalid(id, other, "done")),
        }
        self.statuses[idx.index()] = TaskStatus::Done;

        let mut unlocked = Vec::new();
        let successors: Vec<NodeIndex> = self.graph.successors(idx).collect();
        for succ in successors {
            if !matches!(self.statuses[succ.index()], TaskStatus::Pending) {
                continue;
            }
            let satisfied = self
                .graph
                .predecessors(succ)
                .all(|pred| matches!(self.statuses[pred.index()], TaskStatus::Done));
            if satisfied {
                self.statuses[succ.index()] = TaskStatus::Ready;
                unlocked.push(self.graph.node(succ).id.clone());
            }
        }
        unlocked.sort_by_key(|tid| self.graph.node_index(tid).map(|i| i.index()));
        Ok(unlocked)
    }

    /// Mark a task failed and fail every transitive successor with
    /// [`TaskError::DependencyFailed`].
    ///
    /// Accepts any non-terminal task so cancelled, never-dispatched tasks can
    /// be closed out too. Returns the successors failed by propagation.
    pub fn mark_failed(&mut self, id: &TaskId, error: TaskError) -> Result<Vec<TaskId>> {
        let idx = self.index_of(id)?;
        if self.statuses[idx.index()].is_terminal() {
            let current = self.statuses[idx.index()].clone();
            return Err(self.invalid(id, &current, "failed"));
        }
        self.statuses[idx.index()] = TaskStatus::Failed { error };

        let mut propagated = Vec::new();
        let mut queue: VecDeque<NodeIndex> = self.graph.successors(idx).collect();
        while let Some(next) = queue.pop_front() {
            if self.statuses[next.index()].is_terminal() {
                continue;
            }
            self.statuses[next.index()] = TaskStatus::Failed {
                error: TaskError::DependencyFailed {
                    upstream: id.clone(),
                },
            };
            let next_id = self.graph.node(next).id.clone();
            debug!(task = %next_id, upstream = %id, "failed by dependency");
            propagated.push(next_id);
            queue.extend(self.graph.successors(next));
        }
        propagated.sort_by_key(|tid| self.graph.node_index(tid).map(|i| i.index()));
        Ok(propagated)
    }

    /// Fail every task that has not started with [`TaskError::Cancelled`].
    ///
    /// Running tasks are left alone so their outcome can still be recorded.
    pub fn cancel_unstarted(&mut self) -> Vec<TaskId> {
        let cancelled = self.unstarted();
        for tid in &cancelled {
            if let Some(idx) = self.graph.node_index(tid) {
                self.statuses[idx.index()] = TaskStatus::Failed {
                    error: TaskError::Cancelled,
                };
            }
        }
        cancelled
    }

    /// True when every task is done or failed.
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(TaskStatus::is_terminal)
    }

    pub fn running_count(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Running))
    }

    pub fn done_count(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Done))
    }

    /// Failed tasks (direct and by dependency) in insertion order.
    pub fn failed(&self) -> Vec<TaskId> {
        self.ids_where(TaskStatus::is_failed)
    }

    /// Tasks that have not started and are not terminal.
    pub fn unstarted(&self) -> Vec<TaskId> {
        self.ids_where(|s| matches!(s, TaskStatus::Pending | TaskStatus::Ready))
    }

    /// Snapshot of every task's status in insertion order.
    pub fn statuses(&self) -> Vec<(TaskId, TaskStatus)> {
        self.graph
            .indices()
            .map(|idx| {
                (
                    self.graph.node(idx).id.clone(),
                    self.statuses[idx.index()].clone(),
                )
            })
            .collect()
    }

    fn ids_where(&self, pred: impl Fn(&TaskStatus) -> bool) -> Vec<TaskId> {
        self.graph
            .indices()
            .filter(|idx| pred(&self.statuses[idx.index()]))
            .map(|idx| self.graph.node(idx).id.clone())
            .collect()
    }

    fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.statuses.iter().filter(|s| pred(*s)).count()
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.graph
            .node_index(id)
            .ok_or_else(|| Error::Validation(format!("task '{}' not found in graph", id)))
    }

    fn invalid(&self, id: &TaskId, from: &TaskStatus, to: &str) -> Error {
        Error::InvalidTransition {
            task: id.clone(),
            from: from.label().to_string(),
            to: to.to_string(),
        }
    }
}
