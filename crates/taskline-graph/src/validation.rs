use crate::{GraphNodeData, TaskGraph};

/// Outcome of [`TaskGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

impl<T: GraphNodeData> TaskGraph<T> {
    /// Runs the structural checks a caller would want before scheduling:
    /// today, only cycle-freedom.
    pub fn validate(&self) -> ValidationResult {
        if self.has_cycles() {
            ValidationResult::invalid(vec!["graph contains a dependency cycle".to_string()])
        } else {
            ValidationResult::valid()
        }
    }
}
