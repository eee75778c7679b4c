use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// An opaque value published by a step. The bus never interprets its
/// contents (spec.md §3) — only the publishing and consuming step bodies
/// agree on what's inside.
pub type ArtifactValue = Arc<dyn Any + Send + Sync>;

/// Downcasts an artifact value to a concrete type, for a consumer that
/// knows what its prerequisite published.
pub fn downcast<T: 'static>(value: &ArtifactValue) -> Option<&T> {
    value.downcast_ref::<T>()
}

/// The set of named artifact lists one step instance has published.
pub type ArtifactBucket = HashMap<String, Vec<ArtifactValue>>;

/// Per-pipeline-run artifact storage.
///
/// A step's publishes land in its own bucket immediately, but are only
/// visible to `get_artifacts` once the instance has been marked
/// `Succeeded` — spec.md §4.E: "writes become visible only after the
/// publishing instance reaches `Succeeded`". Groups are transparent:
/// looking an artifact up through a group forwards to the group's own
/// direct prerequisites (see SPEC_FULL.md §9, Open Question 1).
#[derive(Default)]
pub struct ArtifactBus {
    buckets: Mutex<HashMap<String, ArtifactBucket>>,
    visible: Mutex<HashSet<String>>,
}

impl ArtifactBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, instance: &str, name: &str, value: ArtifactValue) {
        let mut buckets = self.buckets.lock().expect("artifact bus mutex poisoned");
        buckets
            .entry(instance.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Makes `instance`'s published artifacts visible to consumers. Called
    /// by the scheduler exactly once, when the instance's Run phase
    /// succeeds.
    pub fn mark_succeeded(&self, instance: &str) {
        self.visible
            .lock()
            .expect("artifact bus mutex poisoned")
            .insert(instance.to_string());
    }

    fn is_visible(&self, instance: &str) -> bool {
        self.visible
            .lock()
            .expect("artifact bus mutex poisoned")
            .contains(instance)
    }

    /// Concatenates `name`'s published values from each of
    /// `direct_prerequisites`, in the order given (the caller passes them
    /// in topological order, per spec.md §4.E). A prerequisite that never
    /// published under `name`, or that is not yet visible, contributes
    /// nothing.
    pub fn get_artifacts(&self, name: &str, direct_prerequisites: &[String]) -> Vec<ArtifactValue> {
        let buckets = self.buckets.lock().expect("artifact bus mutex poisoned");
        let mut result = Vec::new();
        for prerequisite in direct_prerequisites {
            if !self.is_visible(prerequisite) {
                continue;
            }
            if let Some(bucket) = buckets.get(prerequisite) {
                if let Some(values) = bucket.get(name) {
                    result.extend(values.iter().cloned());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpublished_instance_contributes_nothing() {
        let bus = ArtifactBus::new();
        let result = bus.get_artifacts("wheels", &["build".to_string()]);
        assert!(result.is_empty());
    }

    #[test]
    fn publish_before_succeeded_is_invisible() {
        let bus = ArtifactBus::new();
        bus.publish("build", "wheels", Arc::new("wheel-1".to_string()));
        let result = bus.get_artifacts("wheels", &["build".to_string()]);
        assert!(result.is_empty());
    }

    #[test]
    fn publish_becomes_visible_after_succeeded() {
        let bus = ArtifactBus::new();
        bus.publish("build", "wheels", Arc::new("wheel-1".to_string()));
        bus.mark_succeeded("build");
        let result = bus.get_artifacts("wheels", &["build".to_string()]);
        assert_eq!(result.len(), 1);
        assert_eq!(downcast::<String>(&result[0]).unwrap(), "wheel-1");
    }

    #[test]
    fn concatenates_in_prerequisite_order() {
        let bus = ArtifactBus::new();
        bus.publish("a", "files", Arc::new("a1".to_string()));
        bus.publish("b", "files", Arc::new("b1".to_string()));
        bus.mark_succeeded("a");
        bus.mark_succeeded("b");
        let result = bus.get_artifacts("files", &["b".to_string(), "a".to_string()]);
        let values: Vec<&String> = result.iter().map(|v| downcast::<String>(v).unwrap()).collect();
        assert_eq!(values, vec!["b1", "a1"]);
    }
}
