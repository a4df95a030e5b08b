//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("{0} is required")]
    MissingField(String),

    #[error("{field} {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("build \"{build}\" uses project \"{project}\" which is not allowed for this repository")]
    DisallowedJobTarget { build: String, project: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Dependency graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("build \"{build}\" cannot have a dependency to itself")]
    SelfDependency { build: String },

    #[error("build \"{build}\" depends on \"{dependency}\" which does not exist")]
    MissingDependency { build: String, dependency: String },

    #[error("builds \"{build}\" and \"{dependency}\" have a circular dependency")]
    CircularDependency { build: String, dependency: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
