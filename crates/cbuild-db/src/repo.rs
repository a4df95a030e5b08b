//! PostgreSQL store implementations.

pub mod execution;
pub mod lock;

pub use execution::PgExecutionStore;
pub use lock::PgLockStore;
