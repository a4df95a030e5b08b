//! Commit lock store.

use async_trait::async_trait;
use cbuild_core::id::{LockId, TraceId};
use cbuild_core::store::{AcquireOutcome, LockRecord, LockStore};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, Clone, sqlx::FromRow)]
struct LockRow {
    lock_id: String,
    owner_trace_id: uuid::Uuid,
    last_update: DateTime<Utc>,
}

impl From<LockRow> for LockRecord {
    fn from(row: LockRow) -> Self {
        LockRecord {
            id: LockId::from(row.lock_id),
            owner: TraceId::from_uuid(row.owner_trace_id),
            last_update: row.last_update,
        }
    }
}

/// PostgreSQL implementation of LockStore.
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_acquire(
        &self,
        record: &LockRecord,
        stale_before: DateTime<Utc>,
    ) -> DbResult<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, LockRow>(
            "SELECT * FROM locks WHERE lock_id = $1 FOR UPDATE",
        )
        .bind(record.id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) if row.last_update >= stale_before => AcquireOutcome::Held(row.into()),
            Some(row) => {
                sqlx::query(
                    "UPDATE locks SET owner_trace_id = $2, last_update = $3 WHERE lock_id = $1",
                )
                .bind(record.id.as_str())
                .bind(record.owner.as_uuid())
                .bind(record.last_update)
                .execute(&mut *tx)
                .await?;
                AcquireOutcome::Acquired {
                    replaced: Some(row.into()),
                }
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO locks (lock_id, owner_trace_id, last_update)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (lock_id) DO NOTHING
                    "#,
                )
                .bind(record.id.as_str())
                .bind(record.owner.as_uuid())
                .bind(record.last_update)
                .execute(&mut *tx)
                .await?;

                if inserted.rows_affected() == 1 {
                    AcquireOutcome::Acquired { replaced: None }
                } else {
                    // Lost the race to a concurrent insert.
                    let row = sqlx::query_as::<_, LockRow>("SELECT * FROM locks WHERE lock_id = $1")
                        .bind(record.id.as_str())
                        .fetch_one(&mut *tx)
                        .await?;
                    AcquireOutcome::Held(row.into())
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn try_refresh(&self, id: &LockId, owner: &TraceId, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE locks SET last_update = $3 WHERE lock_id = $1 AND owner_trace_id = $2",
        )
        .bind(id.as_str())
        .bind(owner.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_release(&self, id: &LockId, owner: &TraceId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_id = $1 AND owner_trace_id = $2")
            .bind(id.as_str())
            .bind(owner.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_get(&self, id: &LockId) -> DbResult<Option<LockRecord>> {
        let row = sqlx::query_as::<_, LockRow>("SELECT * FROM locks WHERE lock_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn acquire(
        &self,
        record: &LockRecord,
        stale_before: DateTime<Utc>,
    ) -> cbuild_core::Result<AcquireOutcome> {
        Ok(self.try_acquire(record, stale_before).await?)
    }

    async fn refresh(
        &self,
        id: &LockId,
        owner: &TraceId,
        now: DateTime<Utc>,
    ) -> cbuild_core::Result<bool> {
        Ok(self.try_refresh(id, owner, now).await?)
    }

    async fn release(&self, id: &LockId, owner: &TraceId) -> cbuild_core::Result<bool> {
        Ok(self.try_release(id, owner).await?)
    }

    async fn get(&self, id: &LockId) -> cbuild_core::Result<Option<LockRecord>> {
        Ok(self.try_get(id).await?)
    }
}
