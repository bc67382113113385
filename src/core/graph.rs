//! Task graph (DAG) construction and structural validation.
//!
//! The graph is built once from the node list a plan produces. Structural
//! problems (duplicate ids, unknown dependencies, cycles) are rejected here,
//! before anything is dispatched.

use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Plan document as read from disk: an ordered list of task nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDocument {
    pub tasks: Vec<TaskNode>,
}

impl PlanDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`. Node indices
/// follow insertion order, which is also the dispatch order among tasks that
/// are ready at the same time.
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from plan nodes.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on a duplicate id, a dependency on an
    /// unknown id, a self-dependency, or a cycle.
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(nodes.len(), 0);
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let id = node.id.clone();
            if index.contains_key(&id) {
                return Err(Error::Structural(format!("duplicate task id '{}'", id)));
            }
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let node = &graph[idx];
            for dep in &node.depends_on {
                if dep == &node.id {
                    return Err(Error::Structural(format!(
                        "task '{}' depends on itself",
                        node.id
                    )));
                }
                let dep_idx = index.get(dep).ok_or_else(|| {
                    Error::Structural(format!(
                        "task '{}' depends on unknown task '{}'",
                        node.id, dep
                    ))
                })?;
                edges.push((*dep_idx, idx));
            }
        }
        for (from, to) in edges {
            if graph.find_edge(from, to).is_none() {
                graph.add_edge(from, to, ());
            }
        }

        let built = Self { graph, index };
        built.topological_order()?;
        Ok(built)
    }

    pub fn from_plan(plan: PlanDocument) -> Result<Self> {
        Self::new(plan.tasks)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub(crate) fn node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub(crate) fn node(&self, idx: NodeIndex) -> &TaskNode {
        &self.graph[idx]
    }

    /// Node indices in insertion order.
    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub(crate) fn predecessors(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    pub(crate) fn successors(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Direct predecessors of a task.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        match self.index.get(id) {
            Some(&idx) => self.predecessors(idx).map(|p| &self.graph[p]).collect(),
            None => Vec::new(),
        }
    }

    /// Direct successors of a task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        match self.index.get(id) {
            Some(&idx) => self.successors(idx).map(|s| &self.graph[s]).collect(),
            None => Vec::new(),
        }
    }

    /// Tasks ordered so each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = &self.graph[cycle.node_id()].id;
            Error::Structural(format!("dependency cycle detected at task '{}'", id))
        })?;
        Ok(sorted.into_iter().map(|idx| &self.graph[idx]).collect())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
