//! KDL configuration parsing for cbuild.
//!
//! This crate handles parsing of:
//! - Build manifests (cbuild.kdl) and their layered defaults
//! - The build dependency graph
//! - System configuration
//! - Variable interpolation in storage key prefixes

pub mod error;
pub mod graph;
pub mod manifest;
mod nodes;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult, GraphError};
pub use graph::{BuildNode, DependencyGraph};
pub use manifest::{BuildFields, Manifest, ResolveContext, ResolvedManifest, parse_manifest};
pub use system::{RepoConfig, SystemConfig, parse_system_config};
pub use variables::VariableContext;
