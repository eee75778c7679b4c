use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::params::{ParameterLayer, ParameterMap};
use crate::runner::StepRunner;

/// The result a step's callable (or setup callable) reports: `Ok(())` on
/// success, `Err(reason)` on a step-body failure. The reason becomes
/// `Error::StepBodyFailed`'s message.
pub type StepOutcome = std::result::Result<(), String>;

/// A step's run (or setup) behavior.
pub type StepCallable = Arc<dyn Fn(&StepRunner) -> StepOutcome + Send + Sync>;

/// Everything known about one registered step, before parameter expansion.
///
/// Grounded on `original_source/src/wast/__init__.py`'s `Step`/
/// `ManagedStep`/`StepGroup` registration helpers and `_config.py`'s
/// bookkeeping of them.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub callable: Option<StepCallable>,
    pub setup: Option<StepCallable>,
    pub requires: Vec<String>,
    pub interpreter: Option<String>,
    pub dependencies: Vec<String>,
    pub run_by_default: bool,
    pub parameter_layers: Vec<ParameterLayer>,
    pub defaults: Option<ParameterMap>,
    pub is_setup_dependent: bool,
    pub is_managed: bool,
    pub is_group: bool,
}

impl StepDefinition {
    /// A step group: a named alias for a set of dependencies with no
    /// callable of its own.
    pub fn group(name: impl Into<String>, requires: Vec<String>, run_by_default: bool) -> Self {
        Self {
            name: name.into(),
            callable: None,
            setup: None,
            requires,
            interpreter: None,
            dependencies: Vec::new(),
            run_by_default,
            parameter_layers: Vec::new(),
            defaults: None,
            is_setup_dependent: false,
            is_managed: false,
            is_group: true,
        }
    }
}

/// Stores step definitions by name, preserving registration order and
/// rejecting duplicates.
///
/// Grounded on `original_source/src/wast/_config.py`'s `Config.register_step`
/// duplicate-name check.
#[derive(Default)]
pub struct Registry {
    by_name: HashMap<String, Arc<StepDefinition>>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: StepDefinition) -> Result<()> {
        if self.by_name.contains_key(&definition.name) {
            return Err(Error::DuplicateStep {
                name: definition.name,
            });
        }
        self.order.push(definition.name.clone());
        self.by_name
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<StepDefinition>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All registered definitions, in registration order.
    pub fn all(&self) -> impl Iterator<Item = Arc<StepDefinition>> + '_ {
        self.order.iter().map(move |name| self.by_name[name].clone())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            callable: Some(Arc::new(|_: &StepRunner| Ok(()))),
            setup: None,
            requires: Vec::new(),
            interpreter: None,
            dependencies: Vec::new(),
            run_by_default: true,
            parameter_layers: Vec::new(),
            defaults: None,
            is_setup_dependent: true,
            is_managed: false,
            is_group: false,
        }
    }

    #[test]
    fn register_and_lookup_round_trips() {
        let mut registry = Registry::new();
        registry.register(plain_step("build")).unwrap();
        assert!(registry.lookup("build").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = Registry::new();
        registry.register(plain_step("build")).unwrap();
        let err = registry.register(plain_step("build")).unwrap_err();
        assert!(matches!(err, Error::DuplicateStep { name } if name == "build"));
    }

    #[test]
    fn all_preserves_registration_order() {
        let mut registry = Registry::new();
        registry.register(plain_step("b")).unwrap();
        registry.register(plain_step("a")).unwrap();
        let names: Vec<String> = registry.all().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
