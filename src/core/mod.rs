//! Core domain models for swarm.
//!
//! Task nodes, the validated task graph and the dependency tracker that
//! owns every node's status during a run.

pub mod graph;
pub mod task;
pub mod tracker;

pub use graph::{PlanDocument, TaskGraph};
pub use task::{Artifact, TaskError, TaskId, TaskNode, TaskStatus};
pub use tracker::DependencyTracker;
