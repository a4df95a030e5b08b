//! Build definitions and per-build runtime state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of a build within a manifest.
pub type BuildKey = String;

/// Validated, immutable description of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build key (e.g., "test").
    pub key: BuildKey,
    /// Commit status context to report under. No per-build status when unset.
    pub commit_status: Option<String>,
    /// Direct dependencies (other build keys).
    pub depends_on: Vec<BuildKey>,
    /// Branch patterns this build is meant for.
    pub branches: Vec<String>,
    /// Stop the build if the commit is no longer the branch head.
    pub stop_if_not_branch_head: bool,
    /// Parameters passed to the job driver unmodified.
    pub job: JobParams,
}

/// Parameters for the external job that runs a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Allow-listed job target (project) the build runs under.
    pub project: String,
    /// Container image.
    pub image: String,
    /// Shell commands to run.
    pub commands: Vec<String>,
    /// Whether the job runs privileged.
    pub privileged: bool,
    /// Maximum execution time.
    pub timeout_minutes: u32,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Where the commit's source archive is staged.
    pub source: StorageLocation,
    /// Where artifacts go. `None` when the build produces no artifacts.
    pub artifacts: Option<StorageLocation>,
}

/// A bucket plus key prefix. Prefixes may contain `${...}` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub key_prefix: String,
}

/// Status of a build within one execution.
///
/// A build that has not been examined yet has no status (`None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    WaitingForDependency,
    Starting,
    InProgress,
    Succeeded,
    Failed,
    Fault,
    DependencyFailed,
    #[serde(rename = "BUILD_NOTFOUND")]
    BuildNotFound,
    StartFailed,
    Stopped,
    TimedOut,
    Skipped,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            BuildStatus::WaitingForDependency | BuildStatus::Starting | BuildStatus::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::WaitingForDependency => "WAITING_FOR_DEPENDENCY",
            BuildStatus::Starting => "STARTING",
            BuildStatus::InProgress => "IN_PROGRESS",
            BuildStatus::Succeeded => "SUCCEEDED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Fault => "FAULT",
            BuildStatus::DependencyFailed => "DEPENDENCY_FAILED",
            BuildStatus::BuildNotFound => "BUILD_NOTFOUND",
            BuildStatus::StartFailed => "START_FAILED",
            BuildStatus::Stopped => "STOPPED",
            BuildStatus::TimedOut => "TIMED_OUT",
            BuildStatus::Skipped => "SKIPPED",
        }
    }

    /// Human readable text for summaries.
    pub fn text(self) -> &'static str {
        match self {
            BuildStatus::WaitingForDependency => "Waiting for Dependency",
            BuildStatus::Starting => "Starting",
            BuildStatus::InProgress => "In Progress",
            BuildStatus::Succeeded => "Succeeded",
            BuildStatus::Failed => "Failed",
            BuildStatus::Fault => "Fault",
            BuildStatus::DependencyFailed => "Dependency Failed",
            BuildStatus::BuildNotFound => "Build Not Found",
            BuildStatus::StartFailed => "Failed to Start",
            BuildStatus::Stopped => "Stopped",
            BuildStatus::TimedOut => "Timed Out",
            BuildStatus::Skipped => "Skipped",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            BuildStatus::WaitingForDependency => ":zzz:",
            BuildStatus::Starting | BuildStatus::InProgress => ":arrow_forward:",
            BuildStatus::Succeeded => ":+1:",
            BuildStatus::Failed | BuildStatus::DependencyFailed => ":x:",
            BuildStatus::Fault | BuildStatus::BuildNotFound | BuildStatus::StartFailed => ":boom:",
            BuildStatus::Stopped => ":no_entry_sign:",
            BuildStatus::TimedOut => ":alarm_clock:",
            BuildStatus::Skipped => ":white_circle:",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal check for a possibly unset status. Unset is never terminal.
pub fn is_terminal(status: Option<BuildStatus>) -> bool {
    status.is_some_and(BuildStatus::is_terminal)
}

/// Reference to the external job running a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Driver-specific job id.
    pub id: String,
    /// Status as reported by the driver.
    pub status: BuildStatus,
    /// Current phase, if the driver tracks phases.
    pub phase: Option<String>,
    /// Where the job's logs can be found.
    pub logs_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Mutable runtime record of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    pub key: BuildKey,
    pub status: Option<BuildStatus>,
    /// Set once the job has been started.
    pub job: Option<JobInfo>,
    /// Dependencies currently blocking this build.
    pub waiting_for: Vec<BuildKey>,
    pub spec: BuildSpec,
}

impl BuildState {
    pub fn new(spec: BuildSpec) -> Self {
        Self {
            key: spec.key.clone(),
            status: None,
            job: None,
            waiting_for: Vec::new(),
            spec,
        }
    }

    /// Not started yet: unset or waiting on dependencies.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, None | Some(BuildStatus::WaitingForDependency))
    }

    /// Running on the driver with a known job.
    pub fn is_in_progress(&self) -> bool {
        self.status == Some(BuildStatus::InProgress) && self.job.is_some()
    }
}
