use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::traversal::{ParallelGroups, TopologicalOrder};

/// DFS visitation state for [`TaskGraph::find_cycle`].
enum DfsMark {
    Visiting,
    Done,
}

/// Data a graph node must expose so the graph can discover edges and
/// compute scheduling order for it.
pub trait GraphNodeData: Clone {
    /// Names of the nodes this one depends on (must run first).
    fn dependency_names(&self) -> impl Iterator<Item = &str> + '_;
}

/// A single node in a [`TaskGraph`]: a name plus the caller's payload.
#[derive(Debug, Clone)]
pub struct GraphNode<T> {
    pub name: String,
    pub data: T,
}

/// A directed acyclic graph of named nodes, generic over the payload type.
///
/// `TaskGraph` owns the dependency edges between nodes and exposes the
/// algorithms a scheduler needs: cycle detection, a single topological
/// order, and parallel-execution levels.
#[derive(Debug, Clone)]
pub struct TaskGraph<T> {
    graph: DiGraph<GraphNode<T>, ()>,
    name_to_node: HashMap<String, NodeIndex>,
}

impl<T> Default for TaskGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskGraph<T> {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_node: HashMap::new(),
        }
    }

    /// Inserts a node, or returns the index of an existing node with the
    /// same name without modifying it.
    pub fn add_node(&mut self, name: String, data: T) -> Result<NodeIndex> {
        if let Some(&idx) = self.name_to_node.get(&name) {
            return Ok(idx);
        }
        let idx = self.graph.add_node(GraphNode {
            name: name.clone(),
            data,
        });
        self.name_to_node.insert(name, idx);
        Ok(idx)
    }

    pub fn get_node_index(&self, name: &str) -> Option<NodeIndex> {
        self.name_to_node.get(name).copied()
    }

    pub fn get_node_by_name(&self, name: &str) -> Option<&GraphNode<T>> {
        self.get_node_index(name).map(|idx| &self.graph[idx])
    }

    pub fn get_node_mut(&mut self, name: &str) -> Option<&mut GraphNode<T>> {
        let idx = self.get_node_index(name)?;
        Some(&mut self.graph[idx])
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.name_to_node.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &GraphNode<T>> {
        self.graph.node_weights()
    }

    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.add_edge(from, to, ());
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Finds one cycle and returns the full path around it, e.g. `["a",
    /// "b", "a"]` for `a -> b -> a` — every node on the cycle, not just the
    /// one petgraph's `toposort` happens to report.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<NodeIndex, DfsMark> = HashMap::new();
        let mut stack: Vec<NodeIndex> = Vec::new();

        for start in self.graph.node_indices() {
            if marks.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.find_cycle_from(start, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: NodeIndex,
        marks: &mut HashMap<NodeIndex, DfsMark>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        marks.insert(node, DfsMark::Visiting);
        stack.push(node);
        for neighbor in self.graph.neighbors(node) {
            match marks.get(&neighbor) {
                Some(DfsMark::Visiting) => {
                    let start = stack
                        .iter()
                        .position(|&idx| idx == neighbor)
                        .expect("a Visiting node is always still on the stack");
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|&idx| self.graph[idx].name.clone())
                        .collect();
                    cycle.push(self.graph[neighbor].name.clone());
                    return Some(cycle);
                }
                Some(DfsMark::Done) => {}
                None => {
                    if let Some(cycle) = self.find_cycle_from(neighbor, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(node, DfsMark::Done);
        None
    }

    /// Topologically orders the whole graph.
    pub fn topological_sort(&self) -> Result<TopologicalOrder<T>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let path = self.find_cycle().unwrap_or_else(|| {
                vec![self.graph[cycle.node_id()].name.clone()]
            });
            Error::CycleDetected { path }
        })?;
        Ok(order.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Groups nodes by dependency level: group 0 has no dependencies in the
    /// graph, group N depends only on nodes in groups `0..N`.
    pub fn get_parallel_groups(&self) -> Result<ParallelGroups<T>>
    where
        T: GraphNodeData,
    {
        let order = self.topological_sort()?;
        let mut level_of: HashMap<String, usize> = HashMap::new();
        for node in &order {
            let level = node
                .data
                .dependency_names()
                .filter_map(|dep| level_of.get(dep))
                .max()
                .map_or(0, |&l| l + 1);
            level_of.insert(node.name.clone(), level);
        }
        let max_level = level_of.values().copied().max().unwrap_or(0);
        let mut groups: ParallelGroups<T> = vec![Vec::new(); max_level + 1];
        for node in order {
            let level = level_of[&node.name];
            groups[level].push(node);
        }
        Ok(groups)
    }

    /// Adds an edge `dependency -> node` for every `node.dependency_names()`
    /// entry that resolves to a node already in the graph, and collects the
    /// rest as [`Error::MissingDependencies`].
    pub fn add_dependency_edges(&mut self) -> Result<()>
    where
        T: GraphNodeData,
    {
        let mut edges = Vec::new();
        let mut missing = Vec::new();
        for node in self.graph.node_weights() {
            let from_idx = self.name_to_node[&node.name];
            for dep in node.data.dependency_names() {
                match self.name_to_node.get(dep) {
                    Some(&dep_idx) => edges.push((dep_idx, from_idx)),
                    None => missing.push((node.name.clone(), dep.to_string())),
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingDependencies { missing });
        }
        for (from, to) in edges {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    /// Builds a graph containing `start` and every node transitively
    /// reachable through `dependency_names`, resolving payloads on demand
    /// via `get_node`. Edges are added once every reachable node has been
    /// inserted.
    pub fn build_for_node<F>(&mut self, start: &str, mut get_node: F) -> Result<()>
    where
        T: GraphNodeData,
        F: FnMut(&str) -> Option<T>,
    {
        let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);
        let mut seen: HashSet<String> = HashSet::from([start.to_string()]);

        while let Some(name) = queue.pop_front() {
            let data = get_node(&name).ok_or_else(|| Error::MissingDependency {
                node: start.to_string(),
                dependency: name.clone(),
            })?;
            let deps: Vec<String> = data.dependency_names().map(str::to_string).collect();
            self.add_node(name, data)?;
            for dep in deps {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        self.add_dependency_edges()
    }
}

/// Computes the transitive closure of `initial` under `get_deps` via BFS.
pub fn compute_transitive_closure<F, I>(initial: &[String], mut get_deps: F) -> HashSet<String>
where
    F: FnMut(&str) -> I,
    I: IntoIterator<Item = String>,
{
    let mut closure: HashSet<String> = initial.iter().cloned().collect();
    let mut queue: VecDeque<String> = initial.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
        for dep in get_deps(&name) {
            if closure.insert(dep.clone()) {
                queue.push_back(dep);
            }
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Node(Vec<String>);
    impl GraphNodeData for Node {
        fn dependency_names(&self) -> impl Iterator<Item = &str> + '_ {
            self.0.iter().map(String::as_str)
        }
    }

    fn graph_with(edges: &[(&str, &[&str])]) -> TaskGraph<Node> {
        let mut g = TaskGraph::new();
        for (name, deps) in edges {
            g.add_node(
                name.to_string(),
                Node(deps.iter().map(|d| d.to_string()).collect()),
            )
            .unwrap();
        }
        g.add_dependency_edges().unwrap();
        g
    }

    #[test]
    fn new_graph_is_empty() {
        let g: TaskGraph<Node> = TaskGraph::new();
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn add_single_node() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.add_node("a".into(), Node(vec![])).unwrap();
        assert_eq!(g.node_count(), 1);
        assert!(g.contains_node("a"));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        let a1 = g.add_node("a".into(), Node(vec![])).unwrap();
        let a2 = g.add_node("a".into(), Node(vec![])).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn linear_dependency_topological_order() {
        let g = graph_with(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let order: Vec<String> = g.topological_sort().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.add_node("a".into(), Node(vec!["b".into()])).unwrap();
        g.add_node("b".into(), Node(vec!["a".into()])).unwrap();
        g.add_dependency_edges().unwrap();
        assert!(g.has_cycles());
        assert!(g.topological_sort().is_err());
    }

    #[test]
    fn find_cycle_names_every_node_on_the_cycle() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.add_node("a".into(), Node(vec!["b".into()])).unwrap();
        g.add_node("b".into(), Node(vec!["a".into()])).unwrap();
        g.add_dependency_edges().unwrap();
        let cycle = g.find_cycle().unwrap();
        assert!(cycle.contains(&"a".to_string()));
        assert!(cycle.contains(&"b".to_string()));
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.add_node("a".into(), Node(vec!["a".into()])).unwrap();
        g.add_dependency_edges().unwrap();
        assert!(g.has_cycles());
    }

    #[test]
    fn missing_dependency_is_reported() {
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.add_node("a".into(), Node(vec!["ghost".into()])).unwrap();
        let err = g.add_dependency_edges().unwrap_err();
        match err {
            Error::MissingDependencies { missing } => {
                assert_eq!(missing, vec![("a".to_string(), "ghost".to_string())]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn diamond_dependency_parallel_groups() {
        let g = graph_with(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let groups = g.get_parallel_groups().unwrap();
        let names: Vec<Vec<String>> = groups
            .into_iter()
            .map(|level| {
                let mut names: Vec<String> = level.into_iter().map(|n| n.name).collect();
                names.sort();
                names
            })
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn shared_dependency_is_not_duplicated_in_groups() {
        let g = graph_with(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let groups = g.get_parallel_groups().unwrap();
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn empty_graph_has_no_cycles_and_empty_order() {
        let g: TaskGraph<Node> = TaskGraph::new();
        assert!(!g.has_cycles());
        assert!(g.topological_sort().unwrap().is_empty());
    }

    #[test]
    fn build_for_node_discovers_transitive_dependencies() {
        let definitions: HashMap<&str, Vec<&str>> = HashMap::from([
            ("c", vec!["b"]),
            ("b", vec!["a"]),
            ("a", vec![]),
        ]);
        let mut g: TaskGraph<Node> = TaskGraph::new();
        g.build_for_node("c", |name| {
            definitions
                .get(name)
                .map(|deps| Node(deps.iter().map(|d| d.to_string()).collect()))
        })
        .unwrap();
        assert_eq!(g.node_count(), 3);
        let order: Vec<String> = g.topological_sort().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn transitive_closure_collects_all_reachable_names() {
        let deps: HashMap<&str, Vec<&str>> =
            HashMap::from([("a", vec!["b"]), ("b", vec!["c"]), ("c", vec![])]);
        let closure = compute_transitive_closure(&["a".to_string()], |name| {
            deps.get(name)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
        });
        assert_eq!(
            closure,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }
}
