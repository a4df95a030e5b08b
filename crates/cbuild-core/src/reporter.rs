//! Status reporting to the hosting platform.
//!
//! Two kinds of reports exist: a per-build commit status (verdict plus
//! description under a context name) and one aggregate report per execution
//! that rolls every build up into a markdown summary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::execution::Conclusion;
use crate::id::RepoId;
use crate::Result;

/// Verdict of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pending,
    Success,
    Failure,
    Cancelled,
    Neutral,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pending => "pending",
            Verdict::Success => "success",
            Verdict::Failure => "failure",
            Verdict::Cancelled => "cancelled",
            Verdict::Neutral => "neutral",
        }
    }
}

/// Verdict and description pushed for a build status.
pub fn commit_verdict(status: Option<BuildStatus>) -> (Verdict, &'static str) {
    match status {
        None | Some(BuildStatus::WaitingForDependency) => {
            (Verdict::Pending, "Waiting for dependency...")
        }
        Some(BuildStatus::Starting) => (Verdict::Pending, "Starting..."),
        Some(BuildStatus::InProgress) => (Verdict::Pending, "Running..."),
        Some(BuildStatus::Succeeded) => (Verdict::Success, "Successful"),
        Some(BuildStatus::DependencyFailed) => (Verdict::Failure, "Dependency failed"),
        Some(
            BuildStatus::Failed
            | BuildStatus::StartFailed
            | BuildStatus::BuildNotFound
            | BuildStatus::Fault,
        ) => (Verdict::Failure, "Failed"),
        Some(BuildStatus::TimedOut) => (Verdict::Failure, "Timed Out"),
        Some(BuildStatus::Stopped) => (Verdict::Cancelled, "Stopped by User"),
        Some(BuildStatus::Skipped) => (Verdict::Neutral, "Skipped"),
    }
}

/// Where reports for an execution go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTarget {
    pub repo_id: RepoId,
    pub commit_sha: String,
    /// Installation whose token is used, when the platform has one.
    pub installation_id: Option<i64>,
}

/// A per-build commit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub verdict: Verdict,
    /// Status context (e.g., "CBuild/test").
    pub context: String,
    pub description: String,
    pub target_url: Option<String>,
}

/// Status of the aggregate report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Queued,
    InProgress,
    Completed(ReportConclusion),
}

/// Conclusion of a completed aggregate report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportConclusion {
    Success,
    Failure,
    Cancelled,
    Neutral,
}

impl ReportConclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportConclusion::Success => "success",
            ReportConclusion::Failure => "failure",
            ReportConclusion::Cancelled => "cancelled",
            ReportConclusion::Neutral => "neutral",
        }
    }
}

impl From<Conclusion> for ReportConclusion {
    fn from(conclusion: Conclusion) -> Self {
        match conclusion {
            Conclusion::Succeeded => ReportConclusion::Success,
            Conclusion::Failed | Conclusion::Error => ReportConclusion::Failure,
            Conclusion::Stopped => ReportConclusion::Cancelled,
            Conclusion::Neutral => ReportConclusion::Neutral,
        }
    }
}

/// A button offered on the aggregate report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAction {
    pub label: String,
    pub description: String,
    pub identifier: String,
}

impl ReportAction {
    pub fn stop() -> Self {
        Self {
            label: "Stop".to_string(),
            description: "Stop the builds.".to_string(),
            identifier: "stop".to_string(),
        }
    }

    pub fn rerun() -> Self {
        Self {
            label: "Re-Run".to_string(),
            description: "Re-run the builds.".to_string(),
            identifier: "rerun".to_string(),
        }
    }
}

/// The rolled-up report for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    pub name: String,
    /// Repository-qualified execution id, echoed back on report actions.
    pub external_id: String,
    pub status: ReportStatus,
    pub title: String,
    /// Markdown summary.
    pub summary: String,
    pub actions: Vec<ReportAction>,
}

/// Trait for status reporters.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn push_commit_status(&self, target: &ReportTarget, status: &CommitStatus)
    -> Result<()>;

    /// Create the aggregate report when `report_id` is `None`, update it
    /// otherwise. Returns the report's id.
    async fn upsert_report(
        &self,
        target: &ReportTarget,
        report_id: Option<i64>,
        report: &AggregateReport,
    ) -> Result<i64>;
}
