//! Job execution backends for cbuild.
//!
//! - [`DockerJobDriver`] runs each build as a local Docker container.
//! - [`LocalSourceStager`] downloads commit archives into the staging
//!   directory the containers mount.

pub mod docker;
pub mod stager;

pub use docker::DockerJobDriver;
pub use stager::LocalSourceStager;
