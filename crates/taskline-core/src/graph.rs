use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use taskline_graph::{GraphNodeData, TaskGraph};

use crate::error::{Error, Result};
use crate::params::{self, ParameterMap};
use crate::registry::{Registry, StepDefinition};

/// One concrete, fully-parametrized step, ready to be scheduled.
///
/// Grounded on spec.md §3's `StepInstance`.
#[derive(Clone)]
pub struct StepInstance {
    pub fqn: String,
    pub definition: Arc<StepDefinition>,
    pub parameters: ParameterMap,
}

#[derive(Clone)]
struct InstanceNode {
    instance: StepInstance,
    dependency_fqns: Vec<String>,
}

impl GraphNodeData for InstanceNode {
    fn dependency_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.dependency_fqns.iter().map(String::as_str)
    }
}

/// The step-instance dependency graph for one pipeline run, plus the
/// selection algebra over it (spec.md §4.C).
pub struct PipelineGraph {
    graph: TaskGraph<InstanceNode>,
    run_by_default: HashSet<String>,
}

impl PipelineGraph {
    /// Expands every registered definition's parameters into instances,
    /// expands `requires` (definition names) into per-instance dependency
    /// edges, and builds the DAG. Parametrization is run exactly once here,
    /// as a pure function of each definition (spec.md §8).
    pub fn build(registry: &Registry) -> Result<Self> {
        let mut fqns_by_definition: HashMap<String, Vec<String>> = HashMap::new();
        let mut instances: Vec<(Arc<StepDefinition>, StepInstance)> = Vec::new();

        for definition in registry.all() {
            let defaults = definition.defaults.clone().unwrap_or_default();
            let expanded = params::expand(&definition.name, &defaults, &definition.parameter_layers)?;
            let mut fqns = Vec::with_capacity(expanded.len());
            for (parameters, id_suffix) in expanded {
                let fqn = params::fully_qualified_name(&definition.name, &id_suffix);
                fqns.push(fqn.clone());
                instances.push((
                    definition.clone(),
                    StepInstance {
                        fqn,
                        definition: definition.clone(),
                        parameters,
                    },
                ));
            }
            fqns_by_definition.insert(definition.name.clone(), fqns);
        }

        let mut run_by_default = HashSet::new();
        let mut graph: TaskGraph<InstanceNode> = TaskGraph::new();
        let mut unknown: HashSet<String> = HashSet::new();

        for (definition, instance) in &instances {
            if definition.run_by_default {
                run_by_default.insert(instance.fqn.clone());
            }
            let mut dependency_fqns = Vec::new();
            for requirement in &definition.requires {
                match fqns_by_definition.get(requirement) {
                    Some(fqns) => dependency_fqns.extend(fqns.iter().cloned()),
                    None => {
                        unknown.insert(requirement.clone());
                    }
                }
            }
            graph
                .add_node(
                    instance.fqn.clone(),
                    InstanceNode {
                        instance: instance.clone(),
                        dependency_fqns,
                    },
                )
                .map_err(Error::Graph)?;
        }

        if !unknown.is_empty() {
            return Err(Error::UnknownSteps {
                names: unknown.into_iter().collect(),
            });
        }

        graph.add_dependency_edges().map_err(|err| match err {
            taskline_graph::Error::MissingDependencies { missing } => Error::UnknownSteps {
                names: missing.into_iter().map(|(_, dep)| dep).collect(),
            },
            other => Error::Graph(other),
        })?;

        if graph.has_cycles() {
            let path = graph
                .find_cycle()
                .unwrap_or_else(|| vec!["cycle detected".to_string()]);
            return Err(Error::CyclicStepDependencies {
                cycle: path.join(" --> "),
            });
        }

        Ok(Self {
            graph,
            run_by_default,
        })
    }

    pub fn instance(&self, fqn: &str) -> Option<&StepInstance> {
        self.graph.get_node_by_name(fqn).map(|node| &node.data.instance)
    }

    /// The instance's direct prerequisites, in topological order — the
    /// order `get_artifacts` concatenates them in.
    pub fn direct_prerequisites(&self, fqn: &str) -> Vec<String> {
        self.graph
            .get_node_by_name(fqn)
            .map(|node| node.data.dependency_fqns.clone())
            .unwrap_or_default()
    }

    /// The instance's artifact sources: `direct_prerequisites`, but with any
    /// group prerequisite replaced (recursively) by its own prerequisites,
    /// since a group never publishes artifacts itself (SPEC_FULL.md §9, Open
    /// Question 1: groups are transparent for artifact lookup).
    pub fn artifact_sources(&self, fqn: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.expand_through_groups(&self.direct_prerequisites(fqn), &mut seen, &mut out);
        out
    }

    fn expand_through_groups(&self, names: &[String], seen: &mut HashSet<String>, out: &mut Vec<String>) {
        for name in names {
            match self.instance(name) {
                Some(instance) if instance.definition.is_group => {
                    self.expand_through_groups(&self.direct_prerequisites(name), seen, out);
                }
                _ => {
                    if seen.insert(name.clone()) {
                        out.push(name.clone());
                    }
                }
            }
        }
    }

    /// The whole graph, in topological order.
    pub fn topological_order(&self) -> Vec<String> {
        self.graph
            .topological_sort()
            .expect("cycles are rejected at build time")
            .into_iter()
            .map(|node| node.name)
            .collect()
    }

    fn resolve_names(&self, names: &[String]) -> Result<HashSet<String>> {
        let mut resolved = HashSet::new();
        let mut unknown = Vec::new();
        for name in names {
            if self.graph.contains_node(name) {
                resolved.insert(name.clone());
                continue;
            }
            let matches: Vec<String> = self
                .graph
                .iter_nodes()
                .filter(|node| definition_name_of(&node.name) == name.as_str())
                .map(|node| node.name.clone())
                .collect();
            if matches.is_empty() {
                unknown.push(name.clone());
            } else {
                resolved.extend(matches);
            }
        }
        if !unknown.is_empty() {
            return Err(Error::UnknownSteps { names: unknown });
        }
        Ok(resolved)
    }

    fn closure(&self, base: &HashSet<String>) -> HashSet<String> {
        let initial: Vec<String> = base.iter().cloned().collect();
        taskline_graph::compute_transitive_closure(&initial, |fqn| {
            self.direct_prerequisites(fqn).into_iter()
        })
    }

    /// Resolves the CLI selection algebra (spec.md §4.C):
    /// - `only` non-empty: the exact named set, no closure, no defaults.
    /// - otherwise: `steps` (or, if empty, every `run_by_default` instance),
    ///   closed transitively over `requires`.
    /// - `except` is always subtracted at the end, after closure.
    ///
    /// Returns the selected instances in topological order.
    pub fn select(&self, steps: &[String], only: &[String], except: &[String]) -> Result<Vec<String>> {
        let selected = if !only.is_empty() {
            self.resolve_names(only)?
        } else {
            let base = if steps.is_empty() {
                self.run_by_default.clone()
            } else {
                self.resolve_names(steps)?
            };
            self.closure(&base)
        };
        let excluded = if except.is_empty() {
            HashSet::new()
        } else {
            self.resolve_names(except)?
        };
        let final_set: HashSet<String> = selected.difference(&excluded).cloned().collect();
        Ok(self
            .topological_order()
            .into_iter()
            .filter(|fqn| final_set.contains(fqn))
            .collect())
    }
}

fn definition_name_of(fqn: &str) -> &str {
    fqn.split('[').next().unwrap_or(fqn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepDefinition;
    use std::sync::Arc;

    fn def(name: &str, requires: &[&str], run_by_default: bool) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            callable: Some(Arc::new(|_| Ok(()))),
            setup: None,
            requires: requires.iter().map(|s| s.to_string()).collect(),
            interpreter: None,
            dependencies: Vec::new(),
            run_by_default,
            parameter_layers: Vec::new(),
            defaults: None,
            is_setup_dependent: true,
            is_managed: false,
            is_group: false,
        }
    }

    fn linear_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(def("a", &[], true)).unwrap();
        registry.register(def("b", &["a"], true)).unwrap();
        registry.register(def("c", &["b"], false)).unwrap();
        registry
    }

    #[test]
    fn build_produces_topological_order() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        assert_eq!(graph.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn default_selection_excludes_non_default_steps_but_includes_their_requirers_closure() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        let selected = graph.select(&[], &[], &[]).unwrap();
        assert_eq!(selected, vec!["a", "b"]);
    }

    #[test]
    fn steps_closure_pulls_in_requirements() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        let selected = graph.select(&["c".to_string()], &[], &[]).unwrap();
        assert_eq!(selected, vec!["a", "b", "c"]);
    }

    #[test]
    fn only_is_exact_with_no_closure() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        let selected = graph.select(&[], &["c".to_string()], &[]).unwrap();
        assert_eq!(selected, vec!["c"]);
    }

    #[test]
    fn except_subtracts_after_closure() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        let selected = graph
            .select(&["c".to_string()], &[], &["b".to_string()])
            .unwrap();
        assert_eq!(selected, vec!["a", "c"]);
    }

    #[test]
    fn except_can_remove_every_instance_of_a_definition() {
        let mut registry = Registry::new();
        registry.register(def("a", &[], true)).unwrap();
        let graph = PipelineGraph::build(&registry).unwrap();
        let selected = graph.select(&[], &[], &["a".to_string()]).unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn artifact_sources_skip_over_groups() {
        let mut registry = Registry::new();
        registry.register(def("a", &[], true)).unwrap();
        registry
            .register(StepDefinition::group(
                "ci",
                vec!["a".to_string()],
                true,
            ))
            .unwrap();
        registry.register(def("b", &["ci"], true)).unwrap();
        let graph = PipelineGraph::build(&registry).unwrap();
        assert_eq!(graph.direct_prerequisites("b"), vec!["ci"]);
        assert_eq!(graph.artifact_sources("b"), vec!["a"]);
    }

    #[test]
    fn cyclic_requires_is_rejected() {
        let mut registry = Registry::new();
        registry.register(def("a", &["b"], true)).unwrap();
        registry.register(def("b", &["a"], true)).unwrap();
        let err = PipelineGraph::build(&registry).unwrap_err();
        match err {
            Error::CyclicStepDependencies { cycle } => {
                assert!(cycle.contains('a'));
                assert!(cycle.contains('b'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_requirement_is_rejected() {
        let mut registry = Registry::new();
        registry.register(def("a", &["ghost"], true)).unwrap();
        let err = PipelineGraph::build(&registry).unwrap_err();
        assert!(matches!(err, Error::UnknownSteps { .. }));
    }

    #[test]
    fn unknown_selection_name_is_rejected() {
        let graph = PipelineGraph::build(&linear_registry()).unwrap();
        let err = graph.select(&["ghost".to_string()], &[], &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownSteps { .. }));
    }
}
