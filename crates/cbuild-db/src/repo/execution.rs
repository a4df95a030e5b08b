//! Execution store.

use async_trait::async_trait;
use cbuild_core::execution::{
    Conclusion, ExecutionMeta, ExecutionRecord, ExecutionState, ExecutionStatus, StopRequest,
};
use cbuild_core::id::{ExecutionId, RepoId, TraceId};
use cbuild_core::store::ExecutionStore;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// An execution row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub repo_id: String,
    pub execution_id: String,
    pub commit_sha: String,
    pub execution_number: i32,
    pub trace_id: uuid::Uuid,
    pub status: String,
    pub conclusion: Option<String>,
    pub meta: serde_json::Value,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub conclusion_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> DbResult<Self> {
        let invalid = |what: &str, err: String| {
            DbError::InvalidData(format!(
                "{} of {}/{}: {}",
                what, row.repo_id, row.execution_id, err
            ))
        };

        Ok(ExecutionRecord {
            repo_id: row
                .repo_id
                .parse()
                .map_err(|e: cbuild_core::Error| invalid("repo id", e.to_string()))?,
            execution_id: row
                .execution_id
                .parse()
                .map_err(|e: cbuild_core::Error| invalid("execution id", e.to_string()))?,
            trace_id: TraceId::from_uuid(row.trace_id),
            status: row.status.parse().map_err(|e| invalid("status", e))?,
            conclusion: row
                .conclusion
                .as_deref()
                .map(str::parse::<Conclusion>)
                .transpose()
                .map_err(|e| invalid("conclusion", e))?,
            meta: serde_json::from_value(row.meta.clone())?,
            state: serde_json::from_value(row.state.clone())?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            conclusion_at: row.conclusion_at,
        })
    }
}

/// PostgreSQL implementation of ExecutionStore.
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_latest_id(&self, repo: &RepoId, commit: &str) -> DbResult<Option<ExecutionId>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT execution_id FROM executions
            WHERE repo_id = $1 AND commit_sha = $2
            ORDER BY execution_number DESC
            LIMIT 1
            "#,
        )
        .bind(repo.to_string())
        .bind(commit.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        id.map(|id| {
            id.parse()
                .map_err(|e: cbuild_core::Error| DbError::InvalidData(e.to_string()))
        })
        .transpose()
    }

    async fn insert(&self, record: &ExecutionRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (
                repo_id, execution_id, commit_sha, execution_number, trace_id, status,
                conclusion, meta, state, created_at, updated_at, conclusion_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (repo_id, execution_id) DO NOTHING
            "#,
        )
        .bind(record.repo_id.to_string())
        .bind(record.execution_id.to_string())
        .bind(record.execution_id.commit())
        .bind(record.execution_id.number() as i32)
        .bind(record.trace_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.conclusion.map(Conclusion::as_str))
        .bind(serde_json::to_value(&record.meta)?)
        .bind(serde_json::to_value(&record.state)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.conclusion_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!(
                "execution {}/{}",
                record.repo_id, record.execution_id
            )));
        }
        Ok(())
    }

    async fn fetch(&self, repo: &RepoId, id: &ExecutionId) -> DbResult<Option<ExecutionRecord>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE repo_id = $1 AND execution_id = $2",
        )
        .bind(repo.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn update_state(
        &self,
        state: &ExecutionState,
        now: DateTime<Utc>,
    ) -> DbResult<Option<StopRequest>> {
        let meta: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            UPDATE executions
            SET state = $3,
                status = CASE WHEN status = 'COMPLETED' THEN status ELSE 'IN_PROGRESS' END,
                updated_at = $4
            WHERE repo_id = $1 AND execution_id = $2
            RETURNING meta
            "#,
        )
        .bind(state.repo_id.to_string())
        .bind(state.execution_id.to_string())
        .bind(serde_json::to_value(state)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let meta = meta.ok_or_else(|| {
            DbError::NotFound(format!("execution {}/{}", state.repo_id, state.execution_id))
        })?;
        let meta: ExecutionMeta = serde_json::from_value(meta)?;
        Ok(meta.stop)
    }

    async fn mark_completed(
        &self,
        state: &ExecutionState,
        conclusion: Conclusion,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = $3,
                status = 'COMPLETED',
                conclusion = $4,
                conclusion_at = $5,
                updated_at = $5,
                meta = jsonb_set(meta, '{error}', COALESCE(to_jsonb($6::text), 'null'::jsonb))
            WHERE repo_id = $1 AND execution_id = $2
            "#,
        )
        .bind(state.repo_id.to_string())
        .bind(state.execution_id.to_string())
        .bind(serde_json::to_value(state)?)
        .bind(conclusion.as_str())
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!(
                "execution {}/{}",
                state.repo_id, state.execution_id
            )));
        }
        Ok(())
    }

    async fn set_stop(&self, repo: &RepoId, id: &ExecutionId, stop: &StopRequest) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET meta = jsonb_set(meta, '{stop}', $3)
            WHERE repo_id = $1 AND execution_id = $2
            "#,
        )
        .bind(repo.to_string())
        .bind(id.to_string())
        .bind(serde_json::to_value(stop)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("execution {}/{}", repo, id)));
        }
        Ok(())
    }

    async fn fetch_list(
        &self,
        repo: &RepoId,
        commit: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE repo_id = $1 AND ($2::text IS NULL OR commit_sha = $2)
            ORDER BY created_at DESC, execution_number DESC
            LIMIT $3
            "#,
        )
        .bind(repo.to_string())
        .bind(commit.map(str::to_lowercase))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn fetch_unfinished(&self) -> DbResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE status <> 'COMPLETED' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn latest_execution_id(
        &self,
        repo: &RepoId,
        commit: &str,
    ) -> cbuild_core::Result<Option<ExecutionId>> {
        Ok(self.fetch_latest_id(repo, commit).await?)
    }

    async fn create(&self, record: &ExecutionRecord) -> cbuild_core::Result<()> {
        Ok(self.insert(record).await?)
    }

    async fn get(
        &self,
        repo: &RepoId,
        id: &ExecutionId,
    ) -> cbuild_core::Result<Option<ExecutionRecord>> {
        Ok(self.fetch(repo, id).await?)
    }

    async fn save_state(
        &self,
        state: &ExecutionState,
        now: DateTime<Utc>,
    ) -> cbuild_core::Result<Option<StopRequest>> {
        Ok(self.update_state(state, now).await?)
    }

    async fn complete(
        &self,
        state: &ExecutionState,
        conclusion: Conclusion,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> cbuild_core::Result<()> {
        Ok(self.mark_completed(state, conclusion, error, now).await?)
    }

    async fn request_stop(
        &self,
        repo: &RepoId,
        id: &ExecutionId,
        stop: &StopRequest,
    ) -> cbuild_core::Result<()> {
        Ok(self.set_stop(repo, id, stop).await?)
    }

    async fn list(
        &self,
        repo: &RepoId,
        commit: Option<&str>,
        limit: usize,
    ) -> cbuild_core::Result<Vec<ExecutionRecord>> {
        Ok(self.fetch_list(repo, commit, limit).await?)
    }

    async fn list_unfinished(&self) -> cbuild_core::Result<Vec<ExecutionRecord>> {
        Ok(self.fetch_unfinished().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_rejects_bad_status() {
        let row = ExecutionRow {
            repo_id: "github.com/acme/widgets".to_string(),
            execution_id: "abc123/0001".to_string(),
            commit_sha: "abc123".to_string(),
            execution_number: 1,
            trace_id: uuid::Uuid::now_v7(),
            status: "SOMETHING".to_string(),
            conclusion: None,
            meta: serde_json::Value::Null,
            state: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            conclusion_at: None,
        };
        let err = ExecutionRecord::try_from(row).unwrap_err();
        assert!(matches!(err, DbError::InvalidData(_)));
    }
}
