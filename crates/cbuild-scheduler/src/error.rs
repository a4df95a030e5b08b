//! Scheduler error types.

use cbuild_config::ConfigError;
use cbuild_core::id::{LockId, TraceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The manifest failed validation.
    #[error(transparent)]
    Setup(#[from] ConfigError),

    #[error("manifest {0} is missing")]
    ManifestNotFound(String),

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error(
        "commit lock {lock_id} is held by {owner} and was updated within the last {stale_after_secs} seconds"
    )]
    LockHeld {
        lock_id: LockId,
        owner: TraceId,
        stale_after_secs: u64,
    },

    #[error("commit lock {lock_id} is no longer held by this execution")]
    LockLost { lock_id: LockId },

    #[error("failed to persist execution state: {0}")]
    Persist(#[source] cbuild_core::Error),

    #[error("no execution ids left for commit {0}")]
    ExecutionIdExhausted(String),

    #[error("execution {0} is not running")]
    NotRunning(String),

    #[error("execution {0} is already stopping")]
    AlreadyStopping(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[source] cbuild_core::Error),
}

impl SchedulerError {
    /// Errors that abort a step and end the execution with an error conclusion.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::LockLost { .. } | SchedulerError::Persist(_) | SchedulerError::Store(_)
        )
    }

    /// Errors in the manifest, reported as a failing commit status.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SchedulerError::Setup(_) | SchedulerError::ManifestNotFound(_)
        )
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use cbuild_config::GraphError;

    #[test]
    fn test_classification() {
        let lost = SchedulerError::LockLost {
            lock_id: LockId::from("github.com/acme/widgets/abc".to_string()),
        };
        assert!(lost.is_fatal());
        assert!(!lost.is_setup());

        let cycle = SchedulerError::from(ConfigError::from(GraphError::CircularDependency {
            build: "a".to_string(),
            dependency: "b".to_string(),
        }));
        assert!(cycle.is_setup());
        assert!(!cycle.is_fatal());
        assert_eq!(
            cycle.to_string(),
            "builds \"a\" and \"b\" have a circular dependency"
        );
    }
}
