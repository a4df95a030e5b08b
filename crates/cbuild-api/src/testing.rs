//! In-memory wiring for router tests.

use async_trait::async_trait;
use axum::Router;
use cbuild_config::{RepoConfig, SystemConfig};
use cbuild_core::build::{BuildStatus, JobInfo};
use cbuild_core::clock::SystemClock;
use cbuild_core::driver::{JobDriver, JobRequest, SourceArchive, SourceStager};
use cbuild_core::id::RepoId;
use cbuild_core::reporter::{AggregateReport, CommitStatus, ReportTarget, StatusReporter};
use cbuild_core::Result;
use cbuild_db::memory::{MemoryExecutionStore, MemoryLockStore};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use crate::services::ManifestFetcher;
use crate::services::token_cache::TokenCache;
use crate::state::{AppState, Services};

pub const SECRET: &str = "webhook-secret";

pub const MANIFEST: &str = r#"
    version 1
    build "test" {
        project "default"
        image "alpine"
        run "make test"
        source-bucket "sources"
        commit-status "CI/test"
    }
"#;

/// Jobs start and never finish.
struct IdleDriver;

#[async_trait]
impl JobDriver for IdleDriver {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn start(&self, request: &JobRequest) -> Result<JobInfo> {
        Ok(JobInfo {
            id: format!("job-{}", request.build_key),
            status: BuildStatus::InProgress,
            phase: None,
            logs_ref: None,
            started_at: None,
            ended_at: None,
        })
    }

    async fn batch_poll(&self, job_ids: &[String]) -> Result<Vec<JobInfo>> {
        Ok(job_ids
            .iter()
            .map(|id| JobInfo {
                id: id.clone(),
                status: BuildStatus::InProgress,
                phase: None,
                logs_ref: None,
                started_at: None,
                ended_at: None,
            })
            .collect())
    }

    async fn stop(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

struct NoopStager;

#[async_trait]
impl SourceStager for NoopStager {
    async fn ensure_uploaded(
        &self,
        _: &RepoId,
        _: &str,
        _: Option<i64>,
        _: &SourceArchive,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub statuses: Mutex<Vec<CommitStatus>>,
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn push_commit_status(&self, _: &ReportTarget, status: &CommitStatus) -> Result<()> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn upsert_report(
        &self,
        _: &ReportTarget,
        report_id: Option<i64>,
        _: &AggregateReport,
    ) -> Result<i64> {
        Ok(report_id.unwrap_or(1))
    }
}

struct StaticManifest(Option<String>);

#[async_trait]
impl ManifestFetcher for StaticManifest {
    async fn fetch(&self, _: &RepoId, _: &str, _: &str, _: Option<i64>) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub executions: Arc<MemoryExecutionStore>,
    pub reporter: Arc<RecordingReporter>,
}

impl TestApp {
    pub fn new(manifest: Option<&str>) -> Self {
        Self::with_installation(manifest, Some(7))
    }

    /// `installation_id` is the one configured for the repository.
    pub fn with_installation(manifest: Option<&str>, installation_id: Option<i64>) -> Self {
        let repo_id: RepoId = "github.com/acme/widgets".parse().unwrap();
        let mut config = SystemConfig {
            base_url: "https://ci.example.com".to_string(),
            ..Default::default()
        };
        config.repos.insert(
            repo_id.clone(),
            RepoConfig {
                repo_id,
                allowed_projects: vec!["default".to_string()],
                // Keep the background runner quiet during a test.
                wait_seconds: Some(60),
                webhook_secret: Some(SECRET.to_string()),
                installation_id,
                defaults: Default::default(),
            },
        );

        let executions = Arc::new(MemoryExecutionStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let clock = Arc::new(SystemClock);
        let state = AppState::new(
            Arc::new(config),
            Services {
                lock_store: Arc::new(MemoryLockStore::new()),
                executions: executions.clone(),
                driver: Arc::new(IdleDriver),
                stager: Arc::new(NoopStager),
                reporter: reporter.clone(),
                manifests: Arc::new(StaticManifest(manifest.map(String::from))),
                tokens: Arc::new(TokenCache::new(None, None, clock.clone())),
                clock,
            },
        );

        Self {
            state,
            executions,
            reporter,
        }
    }

    pub fn repo_id(&self) -> RepoId {
        "github.com/acme/widgets".parse().unwrap()
    }

    pub fn router(&self) -> Router {
        crate::routes::router(self.state.clone())
    }
}

/// A push event for `acme/widgets` at commit `abc123`.
pub fn push_payload(git_ref: &str, deleted: bool) -> Value {
    json!({
        "ref": git_ref,
        "after": "ABC123",
        "deleted": deleted,
        "head_commit": {
            "id": "abc123",
            "message": "Fix the widget\n\nDetails",
            "author": { "name": "Sam", "username": "sam" },
            "committer": { "name": "Sam", "username": "sam" },
            "timestamp": "2024-05-01T10:00:00Z"
        },
        "repository": {
            "name": "widgets",
            "html_url": "https://github.com/acme/widgets",
            "owner": { "login": "acme", "name": "acme" }
        },
        "sender": { "login": "sam" },
        "installation": { "id": 7 }
    })
}
