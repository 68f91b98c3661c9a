// src/errors.rs

//! Crate-wide error types.
//!
//! Only graph errors and escalated integrity failures abort a build. Task
//! failures are values (`TaskFailure`), and cache IO problems degrade to a
//! miss or a no-op inside the cache layer.

use thiserror::Error;

use crate::snapshot::SnapshotError;

/// Problems with the declared task graph. Always fatal, always raised before
/// any task runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected in task graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("invalid declaration for task '{task}': {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("tasks can no longer be registered once the graph has been planned")]
    RegistrationClosed,
}

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The snapshot store detected a stale cached hash. The build can no
    /// longer be trusted.
    #[error(transparent)]
    SnapshotIntegrity(SnapshotError),

    /// The same cache key failed integrity verification more than once.
    #[error("build cache integrity failure for {key}: {reason}")]
    CacheIntegrity { key: String, reason: String },

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Whether this error must abort the whole build.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KilnError::Graph(_) | KilnError::SnapshotIntegrity(_) | KilnError::CacheIntegrity { .. }
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_full_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle detected in task graph: a -> b -> a");
    }

    #[test]
    fn only_graph_and_integrity_errors_are_fatal() {
        assert!(KilnError::from(GraphError::RegistrationClosed).is_fatal());
        assert!(
            KilnError::CacheIntegrity {
                key: "ab".into(),
                reason: "checksum".into()
            }
            .is_fatal()
        );
        assert!(!KilnError::ConfigError("x".into()).is_fatal());
        assert!(!KilnError::Cancelled.is_fatal());
    }
}
