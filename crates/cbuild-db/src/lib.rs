//! Database layer for cbuild.
//!
//! Provides PostgreSQL and in-memory implementations of the lock and
//! execution stores.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::{MemoryExecutionStore, MemoryLockStore};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

/// Default pool size when the server is not told otherwise.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
