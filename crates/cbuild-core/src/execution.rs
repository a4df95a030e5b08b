//! Executions: the per-commit orchestration state and its persisted record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::build::{BuildState, BuildStatus};
use crate::id::{ExecutionId, LockId, RepoId, TraceId};
use crate::repository::CommitMeta;
use crate::reporter::ReportTarget;

/// Final outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Succeeded,
    Failed,
    Stopped,
    Neutral,
    /// The orchestration itself broke down.
    Error,
}

impl Conclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            Conclusion::Succeeded => "SUCCEEDED",
            Conclusion::Failed => "FAILED",
            Conclusion::Stopped => "STOPPED",
            Conclusion::Neutral => "NEUTRAL",
            Conclusion::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for Conclusion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCEEDED" => Ok(Conclusion::Succeeded),
            "FAILED" => Ok(Conclusion::Failed),
            "STOPPED" => Ok(Conclusion::Stopped),
            "NEUTRAL" => Ok(Conclusion::Neutral),
            "ERROR" => Ok(Conclusion::Error),
            _ => Err(format!("Unknown conclusion: {}", s)),
        }
    }
}

/// Lifecycle of the execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    InProgress,
    Completed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Completed => "COMPLETED",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "IN_PROGRESS" => Ok(ExecutionStatus::InProgress),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            _ => Err(format!("Unknown execution status: {}", s)),
        }
    }
}

/// A credential sealed by the secret store. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredential {
    pub sealed: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SealedCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The full continuation passed between orchestration steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub is_running: bool,
    pub stop_requested: bool,
    /// Seconds the runner waits between steps.
    pub wait_seconds: u64,
    pub repo_id: RepoId,
    pub installation_id: Option<i64>,
    pub execution_id: ExecutionId,
    /// Trace id of the execution; owner of the commit lock.
    pub trace_id: TraceId,
    pub commit_sha: String,
    /// Name of the aggregate report (check run).
    pub checks_name: String,
    /// Handle of the aggregate report once created.
    pub report_id: Option<i64>,
    pub credential: Option<SealedCredential>,
    /// Source archive destinations already staged for this execution.
    pub sources_uploaded: BTreeSet<String>,
    /// Builds in manifest order.
    pub builds: Vec<BuildState>,
}

impl ExecutionState {
    pub fn build(&self, key: &str) -> Option<&BuildState> {
        self.builds.iter().find(|b| b.key == key)
    }

    /// Status of a build. Unknown keys read as unset.
    pub fn status_of(&self, key: &str) -> Option<BuildStatus> {
        self.build(key).and_then(|b| b.status)
    }

    pub fn lock_id(&self) -> LockId {
        LockId::for_commit(&self.repo_id, &self.commit_sha)
    }

    pub fn report_target(&self) -> ReportTarget {
        ReportTarget {
            repo_id: self.repo_id.clone(),
            commit_sha: self.commit_sha.clone(),
            installation_id: self.installation_id,
        }
    }

    /// Whether another step is needed: some build is unset or in progress.
    /// Once a stop was requested only in-progress builds keep it running.
    pub fn compute_is_running(&self) -> bool {
        self.builds.iter().any(|b| match b.status {
            None => !self.stop_requested,
            Some(BuildStatus::InProgress) => true,
            Some(_) => false,
        })
    }

    /// Conclusion for the terminal path.
    pub fn conclusion(&self) -> Conclusion {
        if self.stop_requested {
            return Conclusion::Stopped;
        }

        let tally = self.tally();
        if tally.failed > 0 {
            Conclusion::Failed
        } else if tally.succeeded > 0 {
            Conclusion::Succeeded
        } else {
            Conclusion::Neutral
        }
    }

    pub fn tally(&self) -> BuildTally {
        let mut tally = BuildTally::default();
        for build in &self.builds {
            match build.status {
                Some(BuildStatus::Succeeded) => tally.succeeded += 1,
                Some(BuildStatus::Skipped) => tally.skipped += 1,
                _ => tally.failed += 1,
            }
        }
        tally
    }
}

/// Counts of builds by outcome. Anything neither succeeded nor skipped counts as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Out-of-band request to stop an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub user: String,
    pub requested_at: DateTime<Utc>,
}

/// What kind of event triggered an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    CheckRun,
    CheckSuite,
    Manual,
}

/// Information about what triggered an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    pub action: Option<String>,
    pub sender: Option<String>,
    pub git_ref: Option<String>,
}

/// Metadata stored with an execution beside its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub trigger: TriggerInfo,
    pub commit: Option<CommitMeta>,
    pub stop: Option<StopRequest>,
    /// Error text when the execution concluded with `ERROR`.
    pub error: Option<String>,
}

/// A persisted execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub repo_id: RepoId,
    pub execution_id: ExecutionId,
    pub trace_id: TraceId,
    pub status: ExecutionStatus,
    pub conclusion: Option<Conclusion>,
    pub meta: ExecutionMeta,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub conclusion_at: Option<DateTime<Utc>>,
}
