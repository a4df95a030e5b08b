//! Execution endpoints.
//!
//! Executions are addressed the same way build links in commit statuses are:
//! `/repo/{host}/{owner}/{name}/commit/{commit}/exec/{number}`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use cbuild_core::build::{BuildState, BuildStatus, JobInfo};
use cbuild_core::execution::{
    Conclusion, ExecutionRecord, ExecutionStatus, StopRequest, TriggerInfo,
};
use cbuild_core::id::{ExecutionId, RepoId};
use cbuild_core::repository::CommitMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{host}/{owner}/{name}/executions", get(list_executions))
        .route(
            "/{host}/{owner}/{name}/commit/{commit}/exec/{number}",
            get(get_execution),
        )
        .route(
            "/{host}/{owner}/{name}/commit/{commit}/exec/{number}/build/{key}",
            get(get_build),
        )
        .route(
            "/{host}/{owner}/{name}/commit/{commit}/exec/{number}/stop",
            post(stop_execution),
        )
}

#[derive(Debug, Deserialize)]
struct RepoPath {
    host: String,
    owner: String,
    name: String,
}

impl RepoPath {
    fn repo_id(&self) -> Result<RepoId, ApiError> {
        Ok(RepoId::new(&self.host, &self.owner, &self.name)?)
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionPath {
    host: String,
    owner: String,
    name: String,
    commit: String,
    number: String,
}

impl ExecutionPath {
    fn ids(&self) -> Result<(RepoId, ExecutionId), ApiError> {
        let repo = RepoId::new(&self.host, &self.owner, &self.name)?;
        let execution: ExecutionId = format!("{}/{}", self.commit, self.number).parse()?;
        Ok((repo, execution))
    }
}

#[derive(Debug, Deserialize)]
struct BuildPath {
    host: String,
    owner: String,
    name: String,
    commit: String,
    number: String,
    key: String,
}

impl BuildPath {
    fn split(self) -> (ExecutionPath, String) {
        let execution = ExecutionPath {
            host: self.host,
            owner: self.owner,
            name: self.name,
            commit: self.commit,
            number: self.number,
        };
        (execution, self.key)
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    commit: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StopQuery {
    user: Option<String>,
}

/// Execution as listed.
#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub repo_id: RepoId,
    pub execution_id: ExecutionId,
    pub trace_id: String,
    pub status: ExecutionStatus,
    pub conclusion: Option<Conclusion>,
    pub is_running: bool,
    pub stop_requested: bool,
    pub trigger: TriggerInfo,
    pub commit: Option<CommitMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub conclusion_at: Option<DateTime<Utc>>,
}

impl From<&ExecutionRecord> for ExecutionSummary {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            repo_id: record.repo_id.clone(),
            execution_id: record.execution_id.clone(),
            trace_id: record.trace_id.to_string(),
            status: record.status,
            conclusion: record.conclusion,
            is_running: record.state.is_running,
            stop_requested: record.state.stop_requested || record.meta.stop.is_some(),
            trigger: record.meta.trigger.clone(),
            commit: record.meta.commit.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            conclusion_at: record.conclusion_at,
        }
    }
}

/// One build of an execution.
#[derive(Debug, Serialize)]
pub struct BuildView {
    pub key: String,
    pub status: Option<BuildStatus>,
    pub depends_on: Vec<String>,
    pub waiting_for: Vec<String>,
    pub commit_status: Option<String>,
    pub job: Option<JobInfo>,
}

impl From<&BuildState> for BuildView {
    fn from(build: &BuildState) -> Self {
        Self {
            key: build.key.clone(),
            status: build.status,
            depends_on: build.spec.depends_on.clone(),
            waiting_for: build.waiting_for.clone(),
            commit_status: build.spec.commit_status.clone(),
            job: build.job.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub summary: ExecutionSummary,
    pub checks_name: String,
    pub stop: Option<StopRequest>,
    pub error: Option<String>,
    pub builds: Vec<BuildView>,
}

async fn load(state: &AppState, repo: &RepoId, id: &ExecutionId) -> Result<ExecutionRecord, ApiError> {
    state
        .executions
        .get(repo, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {} not found", id)))
}

async fn list_executions(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionSummary>>, ApiError> {
    let repo = path.repo_id()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let records = state
        .executions
        .list(&repo, query.commit.as_deref(), limit)
        .await?;
    Ok(Json(records.iter().map(ExecutionSummary::from).collect()))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(path): Path<ExecutionPath>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let (repo, id) = path.ids()?;
    let record = load(&state, &repo, &id).await?;
    Ok(Json(ExecutionDetail {
        summary: ExecutionSummary::from(&record),
        checks_name: record.state.checks_name.clone(),
        stop: record.meta.stop.clone(),
        error: record.meta.error.clone(),
        builds: record.state.builds.iter().map(BuildView::from).collect(),
    }))
}

async fn get_build(
    State(state): State<AppState>,
    Path(path): Path<BuildPath>,
) -> Result<Json<BuildView>, ApiError> {
    let (execution, key) = path.split();
    let (repo, id) = execution.ids()?;
    let record = load(&state, &repo, &id).await?;
    record
        .state
        .build(&key)
        .map(|build| Json(BuildView::from(build)))
        .ok_or_else(|| ApiError::NotFound(format!("build {} not found in {}", key, id)))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(path): Path<ExecutionPath>,
    Query(query): Query<StopQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (repo, id) = path.ids()?;
    let user = query.user.unwrap_or_else(|| "api".to_string());
    state.bootstrap.stop(&repo, &id, &user).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "stopping", "execution_id": id })),
    ))
}
