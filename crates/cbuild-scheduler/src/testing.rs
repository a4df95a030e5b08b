//! Fakes shared by the scheduler tests.

use async_trait::async_trait;
use cbuild_config::{RepoConfig, SystemConfig};
use cbuild_core::build::{BuildSpec, BuildState, BuildStatus, JobInfo, JobParams, StorageLocation};
use cbuild_core::clock::Clock;
use cbuild_core::driver::{JobDriver, JobRequest, SourceArchive, SourceStager};
use cbuild_core::execution::{
    ExecutionMeta, ExecutionRecord, ExecutionState, ExecutionStatus, TriggerInfo, TriggerKind,
};
use cbuild_core::id::{ExecutionId, RepoId, TraceId};
use cbuild_core::reporter::{AggregateReport, CommitStatus, ReportTarget, StatusReporter};
use cbuild_core::{Error, Result};
use cbuild_db::memory::{MemoryExecutionStore, MemoryLockStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::bootstrap::Bootstrap;
use crate::engine::Engine;
use crate::lock::LockManager;

pub fn repo_id() -> RepoId {
    "github.com/acme/widgets".parse().unwrap()
}

/// Clock advanced by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Job driver that records calls. Started jobs stay in progress until
/// `finish` sets their status.
#[derive(Default)]
pub struct FakeDriver {
    pub started: Mutex<Vec<JobRequest>>,
    pub stopped: Mutex<Vec<String>>,
    pub polls: Mutex<Vec<Vec<String>>>,
    jobs: Mutex<HashMap<String, BuildStatus>>,
    fail_start: Mutex<HashSet<String>>,
    fail_poll: Mutex<bool>,
    auto_finish: Mutex<Option<BuildStatus>>,
}

impl FakeDriver {
    pub fn job_id(build_key: &str) -> String {
        format!("job-{}", build_key)
    }

    pub fn finish(&self, build_key: &str, status: BuildStatus) {
        self.jobs
            .lock()
            .unwrap()
            .insert(Self::job_id(build_key), status);
    }

    /// Forget a job so polls omit it.
    pub fn lose(&self, build_key: &str) {
        self.jobs.lock().unwrap().remove(&Self::job_id(build_key));
    }

    pub fn fail_start_of(&self, build_key: &str) {
        self.fail_start.lock().unwrap().insert(build_key.to_string());
    }

    pub fn fail_polls(&self, fail: bool) {
        *self.fail_poll.lock().unwrap() = fail;
    }

    /// Report every known job with `status` from now on.
    pub fn auto_finish(&self, status: BuildStatus) {
        *self.auto_finish.lock().unwrap() = Some(status);
    }

    pub fn started_keys(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.build_key.clone())
            .collect()
    }
}

#[async_trait]
impl JobDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(&self, request: &JobRequest) -> Result<JobInfo> {
        if self.fail_start.lock().unwrap().contains(&request.build_key) {
            return Err(Error::ExecutionFailed("project is gone".to_string()));
        }
        self.started.lock().unwrap().push(request.clone());
        let id = Self::job_id(&request.build_key);
        self.jobs
            .lock()
            .unwrap()
            .insert(id.clone(), BuildStatus::InProgress);
        Ok(JobInfo {
            id,
            status: BuildStatus::InProgress,
            phase: Some("QUEUED".to_string()),
            logs_ref: None,
            started_at: None,
            ended_at: None,
        })
    }

    async fn batch_poll(&self, job_ids: &[String]) -> Result<Vec<JobInfo>> {
        self.polls.lock().unwrap().push(job_ids.to_vec());
        if *self.fail_poll.lock().unwrap() {
            return Err(Error::Unavailable("driver is down".to_string()));
        }
        let auto_finish = *self.auto_finish.lock().unwrap();
        let jobs = self.jobs.lock().unwrap();
        Ok(job_ids
            .iter()
            .filter_map(|id| {
                jobs.get(id).map(|status| auto_finish.unwrap_or(*status)).map(|status| JobInfo {
                    id: id.clone(),
                    status,
                    phase: Some(if status.is_terminal() { "COMPLETED" } else { "BUILD" }.to_string()),
                    logs_ref: None,
                    started_at: None,
                    ended_at: None,
                })
            })
            .collect())
    }

    async fn stop(&self, job_id: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

/// Source stager counting distinct upload requests.
#[derive(Default)]
pub struct CountingStager {
    pub uploads: Mutex<Vec<String>>,
    pub installations: Mutex<Vec<Option<i64>>>,
    fail: Mutex<bool>,
}

impl CountingStager {
    pub fn fail_uploads(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl SourceStager for CountingStager {
    async fn ensure_uploaded(
        &self,
        _repo_id: &RepoId,
        _commit_sha: &str,
        installation_id: Option<i64>,
        destination: &SourceArchive,
    ) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(Error::Unavailable("archive download failed".to_string()));
        }
        self.uploads.lock().unwrap().push(destination.dedupe_key());
        self.installations.lock().unwrap().push(installation_id);
        Ok(())
    }
}

/// Status reporter recording everything pushed.
#[derive(Default)]
pub struct RecordingReporter {
    pub statuses: Mutex<Vec<CommitStatus>>,
    pub reports: Mutex<Vec<(Option<i64>, AggregateReport)>>,
    fail: Mutex<bool>,
}

impl RecordingReporter {
    pub const REPORT_ID: i64 = 42;

    pub fn fail_all(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Descriptions pushed for a status context, in order.
    pub fn descriptions(&self, context: &str) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.context == context)
            .map(|s| s.description.clone())
            .collect()
    }

    pub fn last_report(&self) -> Option<AggregateReport> {
        self.reports.lock().unwrap().last().map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn push_commit_status(&self, _target: &ReportTarget, status: &CommitStatus) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(Error::Unavailable("platform is down".to_string()));
        }
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn upsert_report(
        &self,
        _target: &ReportTarget,
        report_id: Option<i64>,
        report: &AggregateReport,
    ) -> Result<i64> {
        if *self.fail.lock().unwrap() {
            return Err(Error::Unavailable("platform is down".to_string()));
        }
        self.reports
            .lock()
            .unwrap()
            .push((report_id, report.clone()));
        Ok(report_id.unwrap_or(Self::REPORT_ID))
    }
}

/// A build spec whose commit status context is its own key.
pub fn spec(key: &str, depends_on: &[&str]) -> BuildSpec {
    BuildSpec {
        key: key.to_string(),
        commit_status: Some(key.to_string()),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        branches: vec![],
        stop_if_not_branch_head: false,
        job: JobParams {
            project: "default".to_string(),
            image: "alpine".to_string(),
            commands: vec!["make".to_string()],
            privileged: false,
            timeout_minutes: 5,
            env: BTreeMap::new(),
            source: StorageLocation {
                bucket: "sources".to_string(),
                key_prefix: "acme/widgets/".to_string(),
            },
            artifacts: None,
        },
    }
}

pub fn execution_state(specs: Vec<BuildSpec>) -> ExecutionState {
    ExecutionState {
        is_running: true,
        stop_requested: false,
        wait_seconds: 0,
        repo_id: repo_id(),
        installation_id: None,
        execution_id: ExecutionId::first("abc123").unwrap(),
        trace_id: TraceId::new(),
        commit_sha: "abc123".to_string(),
        checks_name: "CBuild".to_string(),
        report_id: Some(RecordingReporter::REPORT_ID),
        credential: None,
        sources_uploaded: BTreeSet::new(),
        builds: specs.into_iter().map(BuildState::new).collect(),
    }
}

pub fn record(repo: &RepoId, execution_id: &ExecutionId) -> ExecutionRecord {
    let mut state = execution_state(vec![]);
    state.repo_id = repo.clone();
    state.execution_id = execution_id.clone();
    state.commit_sha = execution_id.commit().to_string();
    record_for(&state, Utc::now())
}

pub fn record_for(state: &ExecutionState, now: DateTime<Utc>) -> ExecutionRecord {
    ExecutionRecord {
        repo_id: state.repo_id.clone(),
        execution_id: state.execution_id.clone(),
        trace_id: state.trace_id,
        status: ExecutionStatus::Queued,
        conclusion: None,
        meta: ExecutionMeta {
            trigger: TriggerInfo {
                kind: TriggerKind::Push,
                action: None,
                sender: Some("sam".to_string()),
                git_ref: Some("refs/heads/main".to_string()),
            },
            commit: None,
            stop: None,
            error: None,
        },
        state: state.clone(),
        created_at: now,
        updated_at: now,
        conclusion_at: None,
    }
}

pub fn repo_config() -> RepoConfig {
    RepoConfig {
        repo_id: repo_id(),
        allowed_projects: vec!["default".to_string()],
        wait_seconds: Some(0),
        webhook_secret: None,
        installation_id: Some(7),
        defaults: Default::default(),
    }
}

/// Everything wired to fakes and in-memory stores.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub lock_store: Arc<MemoryLockStore>,
    pub executions: Arc<MemoryExecutionStore>,
    pub driver: Arc<FakeDriver>,
    pub stager: Arc<CountingStager>,
    pub reporter: Arc<RecordingReporter>,
    pub locks: Arc<LockManager>,
    pub engine: Arc<Engine>,
    pub bootstrap: Bootstrap,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_repo(repo_config())
    }

    pub fn with_repo(repo: RepoConfig) -> Self {
        let mut config = SystemConfig {
            base_url: "https://ci.example.com".to_string(),
            ..Default::default()
        };
        config.repos.insert(repo.repo_id.clone(), repo);
        let config = Arc::new(config);

        let clock = Arc::new(ManualClock::new());
        let lock_store = Arc::new(MemoryLockStore::new());
        let executions = Arc::new(MemoryExecutionStore::new());
        let driver = Arc::new(FakeDriver::default());
        let stager = Arc::new(CountingStager::default());
        let reporter = Arc::new(RecordingReporter::default());
        let locks = Arc::new(LockManager::new(
            lock_store.clone(),
            clock.clone(),
            config.lock_timeout_seconds,
        ));
        let engine = Arc::new(Engine::new(
            locks.clone(),
            executions.clone(),
            driver.clone(),
            stager.clone(),
            reporter.clone(),
            clock.clone(),
            config.base_url.clone(),
        ));
        let bootstrap = Bootstrap::new(
            config,
            locks.clone(),
            executions.clone(),
            reporter.clone(),
            clock.clone(),
        );

        Self {
            clock,
            lock_store,
            executions,
            driver,
            stager,
            reporter,
            locks,
            engine,
            bootstrap,
        }
    }

    /// Persist `state` as a new execution holding its commit lock.
    pub async fn seed(&self, state: &ExecutionState) {
        use cbuild_core::store::ExecutionStore;
        self.executions
            .create(&record_for(state, self.clock.now()))
            .await
            .unwrap();
        self.locks
            .acquire(&state.lock_id(), &state.trace_id)
            .await
            .unwrap();
    }
}
