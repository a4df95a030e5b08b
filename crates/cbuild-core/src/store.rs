//! Durable storage traits for locks and executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{Conclusion, ExecutionRecord, ExecutionState, StopRequest};
use crate::id::{ExecutionId, LockId, RepoId, TraceId};
use crate::Result;

/// A held commit lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: LockId,
    /// Trace id of the execution holding the lock.
    pub owner: TraceId,
    pub last_update: DateTime<Utc>,
}

/// Outcome of a conditional lock create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock was written. `replaced` is the stale lock that was overwritten, if any.
    Acquired { replaced: Option<LockRecord> },
    /// A fresh lock exists.
    Held(LockRecord),
}

/// Conditional key-value storage for locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write `record` unless a lock with the same id was updated at or after `stale_before`.
    async fn acquire(&self, record: &LockRecord, stale_before: DateTime<Utc>)
    -> Result<AcquireOutcome>;

    /// Touch the lock if `owner` holds it. Returns false when it does not.
    async fn refresh(&self, id: &LockId, owner: &TraceId, now: DateTime<Utc>) -> Result<bool>;

    /// Delete the lock if `owner` holds it. Returns false when it does not.
    async fn release(&self, id: &LockId, owner: &TraceId) -> Result<bool>;

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>>;
}

/// Storage for execution records and their state.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Most recent execution id for a commit.
    async fn latest_execution_id(&self, repo: &RepoId, commit: &str)
    -> Result<Option<ExecutionId>>;

    /// Insert a new record. Fails with `Conflict` if the id is taken.
    async fn create(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, repo: &RepoId, id: &ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Persist the state of a running execution and return any stop request
    /// recorded out of band.
    async fn save_state(
        &self,
        state: &ExecutionState,
        now: DateTime<Utc>,
    ) -> Result<Option<StopRequest>>;

    /// Persist the final state and mark the execution completed.
    async fn complete(
        &self,
        state: &ExecutionState,
        conclusion: Conclusion,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Record an out-of-band stop request.
    async fn request_stop(&self, repo: &RepoId, id: &ExecutionId, stop: &StopRequest)
    -> Result<()>;

    /// Executions of a repository, newest first, optionally for one commit.
    async fn list(
        &self,
        repo: &RepoId,
        commit: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Executions not yet completed.
    async fn list_unfinished(&self) -> Result<Vec<ExecutionRecord>>;
}
