//! In-memory stores for tests and single-process development servers.

use async_trait::async_trait;
use cbuild_core::execution::{
    Conclusion, ExecutionRecord, ExecutionState, ExecutionStatus, StopRequest,
};
use cbuild_core::id::{ExecutionId, LockId, RepoId, TraceId};
use cbuild_core::store::{AcquireOutcome, ExecutionStore, LockRecord, LockStore};
use cbuild_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// LockStore backed by a map.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<LockId, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(
        &self,
        record: &LockRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<AcquireOutcome> {
        let mut locks = self.locks.lock().await;
        match locks.get(&record.id) {
            Some(existing) if existing.last_update >= stale_before => {
                Ok(AcquireOutcome::Held(existing.clone()))
            }
            _ => {
                let replaced = locks.insert(record.id.clone(), record.clone());
                Ok(AcquireOutcome::Acquired { replaced })
            }
        }
    }

    async fn refresh(&self, id: &LockId, owner: &TraceId, now: DateTime<Utc>) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(id) {
            Some(lock) if lock.owner == *owner => {
                lock.last_update = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: &LockId, owner: &TraceId) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        if locks.get(id).is_some_and(|lock| lock.owner == *owner) {
            locks.remove(id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>> {
        Ok(self.locks.lock().await.get(id).cloned())
    }
}

/// ExecutionStore backed by a map.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: Mutex<BTreeMap<(RepoId, ExecutionId), ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(repo: &RepoId, id: &ExecutionId) -> Error {
    Error::NotFound(format!("execution {}/{}", repo, id))
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn latest_execution_id(&self, repo: &RepoId, commit: &str) -> Result<Option<ExecutionId>> {
        let commit = commit.to_lowercase();
        let records = self.records.lock().await;
        Ok(records
            .keys()
            .filter(|(r, id)| r == repo && id.commit() == commit)
            .map(|(_, id)| id)
            .max_by_key(|id| id.number())
            .cloned())
    }

    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        let key = (record.repo_id.clone(), record.execution_id.clone());
        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "execution {}/{}",
                record.repo_id, record.execution_id
            )));
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, repo: &RepoId, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&(repo.clone(), id.clone())).cloned())
    }

    async fn save_state(
        &self,
        state: &ExecutionState,
        now: DateTime<Utc>,
    ) -> Result<Option<StopRequest>> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&(state.repo_id.clone(), state.execution_id.clone()))
            .ok_or_else(|| not_found(&state.repo_id, &state.execution_id))?;

        record.state = state.clone();
        if record.status != ExecutionStatus::Completed {
            record.status = ExecutionStatus::InProgress;
        }
        record.updated_at = now;
        Ok(record.meta.stop.clone())
    }

    async fn complete(
        &self,
        state: &ExecutionState,
        conclusion: Conclusion,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&(state.repo_id.clone(), state.execution_id.clone()))
            .ok_or_else(|| not_found(&state.repo_id, &state.execution_id))?;

        record.state = state.clone();
        record.status = ExecutionStatus::Completed;
        record.conclusion = Some(conclusion);
        record.conclusion_at = Some(now);
        record.updated_at = now;
        record.meta.error = error;
        Ok(())
    }

    async fn request_stop(&self, repo: &RepoId, id: &ExecutionId, stop: &StopRequest) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&(repo.clone(), id.clone()))
            .ok_or_else(|| not_found(repo, id))?;
        record.meta.stop = Some(stop.clone());
        Ok(())
    }

    async fn list(
        &self,
        repo: &RepoId,
        commit: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let commit = commit.map(str::to_lowercase);
        let records = self.records.lock().await;
        let mut matching: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| &r.repo_id == repo)
            .filter(|r| {
                commit
                    .as_deref()
                    .is_none_or(|c| r.execution_id.commit() == c)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.execution_id.number().cmp(&a.execution_id.number()))
        });
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_unfinished(&self) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.lock().await;
        let mut unfinished: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.status != ExecutionStatus::Completed)
            .cloned()
            .collect();
        unfinished.sort_by_key(|r| r.created_at);
        Ok(unfinished)
    }
}
