//! Execution numbering.

use cbuild_core::id::{ExecutionId, RepoId};
use cbuild_core::store::ExecutionStore;
use std::sync::Arc;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Allocates `commit/NNNN` execution ids. Only call while holding the commit lock.
pub struct ExecutionSequencer {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionSequencer {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    pub async fn next_id(&self, repo: &RepoId, commit: &str) -> SchedulerResult<ExecutionId> {
        let latest = self
            .store
            .latest_execution_id(repo, commit)
            .await
            .map_err(SchedulerError::Store)?;

        let next = match &latest {
            Some(latest) => latest
                .next()
                .map_err(|_| SchedulerError::ExecutionIdExhausted(commit.to_string()))?,
            None => ExecutionId::first(commit)
                .map_err(|e| SchedulerError::InvalidCommit(e.to_string()))?,
        };

        debug!(repo = %repo, previous = ?latest, next = %next, "Allocated execution id");
        Ok(next)
    }
}
