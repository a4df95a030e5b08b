//! GitHub API client: commit statuses, check runs and manifest contents.

use async_trait::async_trait;
use cbuild_core::auth::TokenSource;
use cbuild_core::id::RepoId;
use cbuild_core::reporter::{
    AggregateReport, CommitStatus, ReportStatus, ReportTarget, StatusReporter, Verdict,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::ManifestFetcher;

const USER_AGENT: &str = "cbuild";

/// Longest description GitHub accepts on a commit status.
const MAX_STATUS_DESCRIPTION: usize = 140;

/// GitHub API client authenticating with installation tokens.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn repo_url(&self, repo: &RepoId, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url,
            repo.owner(),
            repo.name(),
            path
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        installation_id: Option<i64>,
    ) -> Result<reqwest::RequestBuilder, GitHubError> {
        let mut request = self
            .client
            .request(method, url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        let token = self
            .tokens
            .token(installation_id)
            .await
            .map_err(|e| GitHubError::Auth(e.to_string()))?;
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Create a commit status.
    pub async fn create_status(
        &self,
        target: &ReportTarget,
        status: &CommitStatus,
    ) -> Result<(), GitHubError> {
        let url = self.repo_url(&target.repo_id, &format!("statuses/{}", target.commit_sha));
        let payload = StatusPayload::from(status);

        let response = self
            .request(reqwest::Method::POST, &url, target.installation_id)
            .await?
            .json(&payload)
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to create status: {}",
                text
            )));
        }
        Ok(())
    }

    /// Create a check run, or update it when `check_run_id` is set. Returns its id.
    pub async fn upsert_check_run(
        &self,
        target: &ReportTarget,
        check_run_id: Option<i64>,
        report: &AggregateReport,
    ) -> Result<i64, GitHubError> {
        let payload = CheckRunPayload::new(target, report);
        let (method, url) = match check_run_id {
            Some(id) => (
                reqwest::Method::PATCH,
                self.repo_url(&target.repo_id, &format!("check-runs/{}", id)),
            ),
            None => (
                reqwest::Method::POST,
                self.repo_url(&target.repo_id, "check-runs"),
            ),
        };

        let response = self
            .request(method, &url, target.installation_id)
            .await?
            .json(&payload)
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to write check run: {}",
                text
            )));
        }

        let check_run: CheckRunResponse = response
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;
        Ok(check_run.id)
    }

    /// Raw content of a file at a commit. `None` when the file does not exist.
    pub async fn get_file(
        &self,
        repo: &RepoId,
        commit_sha: &str,
        path: &str,
        installation_id: Option<i64>,
    ) -> Result<Option<String>, GitHubError> {
        let url = self.repo_url(repo, &format!("contents/{}", path.trim_start_matches('/')));
        let response = self
            .request(reqwest::Method::GET, &url, installation_id)
            .await?
            .header("Accept", "application/vnd.github.raw+json")
            .query(&[("ref", commit_sha)])
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to get {} ({}): {}",
                path, status, text
            )));
        }

        response
            .text()
            .await
            .map(Some)
            .map_err(|e| GitHubError::Parse(e.to_string()))
    }
}

#[async_trait]
impl StatusReporter for GitHubClient {
    async fn push_commit_status(
        &self,
        target: &ReportTarget,
        status: &CommitStatus,
    ) -> cbuild_core::Result<()> {
        debug!(repo = %target.repo_id, context = %status.context, "Creating commit status");
        self.create_status(target, status).await.map_err(Into::into)
    }

    async fn upsert_report(
        &self,
        target: &ReportTarget,
        report_id: Option<i64>,
        report: &AggregateReport,
    ) -> cbuild_core::Result<i64> {
        self.upsert_check_run(target, report_id, report)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl ManifestFetcher for GitHubClient {
    async fn fetch(
        &self,
        repo: &RepoId,
        commit_sha: &str,
        path: &str,
        installation_id: Option<i64>,
    ) -> cbuild_core::Result<Option<String>> {
        self.get_file(repo, commit_sha, path, installation_id)
            .await
            .map_err(Into::into)
    }
}

/// Commit statuses only know pending, success, failure and error.
fn status_state(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Pending => "pending",
        Verdict::Success | Verdict::Neutral => "success",
        Verdict::Failure => "failure",
        Verdict::Cancelled => "error",
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    state: &'static str,
    context: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<String>,
}

impl From<&CommitStatus> for StatusPayload {
    fn from(status: &CommitStatus) -> Self {
        Self {
            state: status_state(status.verdict),
            context: status.context.clone(),
            description: truncate(&status.description, MAX_STATUS_DESCRIPTION),
            target_url: status.target_url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckRunPayload {
    name: String,
    head_sha: String,
    external_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<&'static str>,
    output: CheckRunOutput,
    actions: Vec<cbuild_core::reporter::ReportAction>,
}

#[derive(Debug, Serialize)]
struct CheckRunOutput {
    title: String,
    summary: String,
}

impl CheckRunPayload {
    fn new(target: &ReportTarget, report: &AggregateReport) -> Self {
        let (status, conclusion) = match report.status {
            ReportStatus::Queued => ("queued", None),
            ReportStatus::InProgress => ("in_progress", None),
            ReportStatus::Completed(conclusion) => ("completed", Some(conclusion.as_str())),
        };
        Self {
            name: report.name.clone(),
            head_sha: target.commit_sha.clone(),
            external_id: report.external_id.clone(),
            status,
            conclusion,
            output: CheckRunOutput {
                title: report.title.clone(),
                summary: report.summary.clone(),
            },
            actions: report.actions.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    id: i64,
}

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl From<GitHubError> for cbuild_core::Error {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::Request(_) | GitHubError::Auth(_) => {
                cbuild_core::Error::Unavailable(err.to_string())
            }
            GitHubError::Api(_) | GitHubError::Parse(_) => {
                cbuild_core::Error::ExecutionFailed(err.to_string())
            }
        }
    }
}
