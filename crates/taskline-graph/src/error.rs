use std::fmt;

/// Errors produced while building or analyzing a [`crate::TaskGraph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    CycleDetected {
        path: Vec<String>,
    },
    MissingDependency {
        node: String,
        dependency: String,
    },
    MissingDependencies {
        missing: Vec<(String, String)>,
    },
    TopologicalSortFailed {
        reason: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CycleDetected { path } => {
                write!(f, "cyclic dependencies between nodes: {}", path.join(" --> "))
            }
            Error::MissingDependency { node, dependency } => {
                write!(f, "node '{node}' depends on unknown node '{dependency}'")
            }
            Error::MissingDependencies { missing } => {
                write!(f, "graph has {} missing dependencies:", missing.len())?;
                for (node, dependency) in missing {
                    write!(f, " '{node}' -> '{dependency}'")?;
                }
                Ok(())
            }
            Error::TopologicalSortFailed { reason } => {
                write!(f, "topological sort failed: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
