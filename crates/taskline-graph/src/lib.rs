//! Generic DAG storage and scheduling-order algorithms.
//!
//! [`TaskGraph`] is agnostic to what a node represents; `taskline-core`
//! instantiates it once per step instance to build the dependency graph a
//! scheduler walks.

mod error;
mod graph;
mod traversal;
mod validation;

pub use error::{Error, Result};
pub use graph::{compute_transitive_closure, GraphNode, GraphNodeData, TaskGraph};
pub use traversal::{ParallelGroups, TopologicalOrder};
pub use validation::ValidationResult;
