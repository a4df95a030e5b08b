//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for cbuild_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => cbuild_core::Error::NotFound(what),
            DbError::Duplicate(what) => cbuild_core::Error::Conflict(what),
            DbError::Database(e) => cbuild_core::Error::Unavailable(e.to_string()),
            other => cbuild_core::Error::Internal(other.to_string()),
        }
    }
}
