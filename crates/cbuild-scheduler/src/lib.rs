//! Execution orchestration for cbuild.
//!
//! An execution runs every build of a commit's manifest. Starting one takes
//! the commit lock and persists the initial state; the runner then steps the
//! engine until no build is left to start or wait on.

pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod lock;
pub mod runner;
pub mod sequencer;
pub mod summary;

#[cfg(test)]
mod testing;

pub use bootstrap::{Bootstrap, StartRequest, StartedExecution};
pub use engine::Engine;
pub use error::{SchedulerError, SchedulerResult};
pub use lock::LockManager;
pub use runner::ExecutionRunner;
pub use sequencer::ExecutionSequencer;
