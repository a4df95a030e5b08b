//! Core domain types and traits for the cbuild CI orchestrator.
//!
//! This crate contains:
//! - Platform access tokens
//! - Identifiers (trace, repository, execution, lock)
//! - Build specs, build state and the execution state machine's data
//! - Job driver and source stager traits
//! - Status reporter trait and verdict mapping
//! - Lock and execution store traits

pub mod auth;
pub mod build;
pub mod clock;
pub mod driver;
pub mod error;
pub mod execution;
pub mod id;
pub mod reporter;
pub mod repository;
pub mod store;

pub use error::{Error, Result};
pub use id::{ExecutionId, LockId, RepoId, TraceId};
