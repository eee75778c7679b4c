//! Traversal result types for [`crate::TaskGraph`].

use crate::GraphNode;

/// A topologically sorted sequence of graph nodes: every dependency
/// precedes the nodes that depend on it.
pub type TopologicalOrder<T> = Vec<GraphNode<T>>;

/// Nodes grouped by dependency level.
///
/// Every node in group `N` depends only on nodes in groups `0..N`, so all
/// nodes within one group can run concurrently once every earlier group has
/// finished.
pub type ParallelGroups<T> = Vec<Vec<GraphNode<T>>>;
