//! Repository events: parsed webhook payloads and commit metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, RepoId, parse_long_execution_id};

/// Longest commit message kept in execution metadata.
pub const MAX_COMMIT_MESSAGE_LEN: usize = 101;

/// Commit metadata stored with an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub sha: String,
    /// First line of the message, clipped.
    pub message: String,
    pub author: Option<String>,
    pub committer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CommitMeta {
    fn from_github_commit(value: &serde_json::Value) -> Option<Self> {
        let person = |field: &str| {
            value
                .get(field)
                .and_then(|p| p.get("username").or_else(|| p.get("name")))
                .and_then(|n| n.as_str())
                .map(String::from)
        };

        Some(CommitMeta {
            sha: value.get("id")?.as_str()?.to_string(),
            message: clip_commit_message(
                value.get("message").and_then(|m| m.as_str()).unwrap_or(""),
            ),
            author: person("author"),
            committer: person("committer"),
            timestamp: value
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }
}

/// First line of a commit message, at most `MAX_COMMIT_MESSAGE_LEN` characters.
pub fn clip_commit_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim_end();
    first_line.chars().take(MAX_COMMIT_MESSAGE_LEN).collect()
}

/// Repository id from a GitHub `repository` object. The host comes from `html_url`.
fn repo_id_from_payload(payload: &serde_json::Value) -> Option<RepoId> {
    let repository = payload.get("repository")?;
    let html_url = repository.get("html_url")?.as_str()?;
    let host = url::Url::parse(html_url).ok()?.host_str()?.to_string();
    let owner = repository
        .get("owner")
        .and_then(|o| o.get("login").or_else(|| o.get("name")))
        .and_then(|n| n.as_str())?;
    let name = repository.get("name")?.as_str()?;
    RepoId::new(&host, owner, name).ok()
}

fn installation_id(payload: &serde_json::Value) -> Option<i64> {
    payload
        .get("installation")
        .and_then(|i| i.get("id"))
        .and_then(|id| id.as_i64())
}

fn sender(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("sender")
        .and_then(|s| s.get("login"))
        .and_then(|l| l.as_str())
        .map(String::from)
}

/// Parsed push event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub repo_id: RepoId,
    pub git_ref: String,
    pub after: String,
    /// The ref was deleted; nothing to build.
    pub deleted: bool,
    pub branch: Option<String>,
    pub head_commit: Option<CommitMeta>,
    pub sender: Option<String>,
    pub installation_id: Option<i64>,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let git_ref = payload.get("ref")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_lowercase();
        let branch = git_ref.strip_prefix("refs/heads/").map(String::from);

        Some(PushEvent {
            repo_id: repo_id_from_payload(payload)?,
            deleted: payload
                .get("deleted")
                .and_then(|d| d.as_bool())
                .unwrap_or(false),
            head_commit: payload
                .get("head_commit")
                .and_then(CommitMeta::from_github_commit),
            sender: sender(payload),
            installation_id: installation_id(payload),
            git_ref,
            after,
            branch,
        })
    }
}

/// What a check event asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckAction {
    /// Run the commit's builds again.
    Rerun,
    /// Stop a running execution.
    Stop {
        repo_id: RepoId,
        execution_id: ExecutionId,
    },
}

/// Parsed `check_run` / `check_suite` event.
#[derive(Debug, Clone)]
pub struct CheckEvent {
    pub repo_id: RepoId,
    pub head_sha: String,
    pub action: CheckAction,
    pub sender: Option<String>,
    pub installation_id: Option<i64>,
}

impl CheckEvent {
    /// Parse a GitHub check event. Returns `None` for events that ask for nothing.
    pub fn from_github_payload(event_type: &str, payload: &serde_json::Value) -> Option<Self> {
        let object = match event_type {
            "check_run" => payload.get("check_run")?,
            "check_suite" => payload.get("check_suite")?,
            _ => return None,
        };
        let action = payload.get("action")?.as_str()?;
        let identifier = payload
            .get("requested_action")
            .and_then(|a| a.get("identifier"))
            .and_then(|i| i.as_str());

        let action = match (event_type, action, identifier) {
            (_, "rerequested", _) | ("check_run", "requested_action", Some("rerun")) => {
                CheckAction::Rerun
            }
            ("check_run", "requested_action", Some("stop")) => {
                let external_id = object.get("external_id")?.as_str()?;
                let (repo_id, execution_id) = parse_long_execution_id(external_id).ok()?;
                CheckAction::Stop {
                    repo_id,
                    execution_id,
                }
            }
            _ => return None,
        };

        Some(CheckEvent {
            repo_id: repo_id_from_payload(payload)?,
            head_sha: object.get("head_sha")?.as_str()?.to_lowercase(),
            action,
            sender: sender(payload),
            installation_id: installation_id(payload),
        })
    }
}
