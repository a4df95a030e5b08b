//! API server for cbuild.
//!
//! Receives hosting-platform webhooks, starts executions and serves their
//! state over a REST API.

pub mod error;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

pub use state::AppState;
