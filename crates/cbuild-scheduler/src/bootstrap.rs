//! Starting and stopping executions.
//!
//! Starting resolves the manifest, takes the commit lock, allocates the next
//! execution id and persists the initial state. The first step is left to the
//! runner.

use cbuild_config::manifest::{DEFAULT_CHECKS_NAME, branch_matches, peek_checks_name};
use cbuild_config::{ResolveContext, ResolvedManifest, SystemConfig, VariableContext, parse_manifest};
use cbuild_core::build::{BuildState, BuildStatus};
use cbuild_core::clock::Clock;
use cbuild_core::execution::{
    ExecutionMeta, ExecutionRecord, ExecutionState, ExecutionStatus, StopRequest, TriggerInfo,
};
use cbuild_core::id::{ExecutionId, LockId, RepoId, TraceId, long_execution_id};
use cbuild_core::reporter::{
    AggregateReport, CommitStatus, ReportAction, ReportStatus, ReportTarget, StatusReporter,
    Verdict,
};
use cbuild_core::repository::CommitMeta;
use cbuild_core::store::ExecutionStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lock::LockManager;
use crate::sequencer::ExecutionSequencer;
use crate::summary;

/// What to start an execution for.
#[derive(Debug, Clone)]
pub struct StartRequest<'a> {
    pub repo_id: &'a RepoId,
    /// Manifest text, `None` when the commit has no manifest.
    pub manifest: Option<&'a str>,
    pub commit_sha: &'a str,
    /// Pushed branch. Unknown for re-runs, in which case no build is skipped.
    pub branch: Option<&'a str>,
    /// Platform installation the triggering event came from. The repository
    /// config's installation takes precedence.
    pub installation_id: Option<i64>,
    pub trigger: TriggerInfo,
    pub commit: Option<CommitMeta>,
}

/// A started execution, ready for its first step.
#[derive(Debug, Clone)]
pub struct StartedExecution {
    pub execution_id: ExecutionId,
    pub lock_id: LockId,
    pub trace_id: TraceId,
    pub state: ExecutionState,
}

pub struct Bootstrap {
    config: Arc<SystemConfig>,
    locks: Arc<LockManager>,
    executions: Arc<dyn ExecutionStore>,
    sequencer: ExecutionSequencer,
    reporter: Arc<dyn StatusReporter>,
    clock: Arc<dyn Clock>,
}

impl Bootstrap {
    pub fn new(
        config: Arc<SystemConfig>,
        locks: Arc<LockManager>,
        executions: Arc<dyn ExecutionStore>,
        reporter: Arc<dyn StatusReporter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            locks,
            sequencer: ExecutionSequencer::new(executions.clone()),
            executions,
            reporter,
            clock,
        }
    }

    pub async fn start_execution(
        &self,
        request: StartRequest<'_>,
    ) -> SchedulerResult<StartedExecution> {
        let repo_id = request.repo_id;
        let repo = self
            .config
            .repo(repo_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("repository {}", repo_id)))?;
        let commit_sha = request.commit_sha.to_lowercase();
        let target = ReportTarget {
            repo_id: repo_id.clone(),
            commit_sha: commit_sha.clone(),
            installation_id: repo.installation_id.or(request.installation_id),
        };

        let resolved = match self.resolve_manifest(&request, &commit_sha) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.report_setup_failure(&target, request.manifest, &e).await;
                return Err(e);
            }
        };

        let trace_id = TraceId::new();
        let lock_id = LockId::for_commit(repo_id, &commit_sha);
        self.locks.acquire(&lock_id, &trace_id).await?;

        match self
            .initialize(&request, &resolved, &commit_sha, trace_id, target)
            .await
        {
            Ok(state) => {
                info!(
                    repo = %repo_id,
                    execution = %state.execution_id,
                    trace_id = %trace_id,
                    builds = state.builds.len(),
                    "Execution started"
                );
                Ok(StartedExecution {
                    execution_id: state.execution_id.clone(),
                    lock_id,
                    trace_id,
                    state,
                })
            }
            Err(e) => {
                error!(repo = %repo_id, commit = %commit_sha, error = %e, "Failed to start execution");
                self.locks.release(&lock_id, &trace_id).await;
                Err(e)
            }
        }
    }

    fn resolve_manifest(
        &self,
        request: &StartRequest<'_>,
        commit_sha: &str,
    ) -> SchedulerResult<ResolvedManifest> {
        let text = request
            .manifest
            .ok_or_else(|| SchedulerError::ManifestNotFound(self.config.manifest_file.clone()))?;
        // Repository config was checked by the caller.
        let repo = self
            .config
            .repo(request.repo_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("repository {}", request.repo_id)))?;

        let variables = VariableContext::new(request.repo_id.clone(), commit_sha);
        let resolved = parse_manifest(text)?.resolve(&ResolveContext {
            defaults: vec![&self.config.defaults, &repo.defaults],
            allowed_projects: Some(&repo.allowed_projects),
            variables: &variables,
        })?;
        Ok(resolved)
    }

    /// Push a failing commit status explaining why nothing ran.
    async fn report_setup_failure(
        &self,
        target: &ReportTarget,
        manifest: Option<&str>,
        cause: &SchedulerError,
    ) {
        let file = &self.config.manifest_file;
        let description = match cause {
            SchedulerError::ManifestNotFound(_) => format!("{} is missing", file),
            other => format!("{} is invalid: {}", file, other),
        };
        warn!(repo = %target.repo_id, commit = %target.commit_sha, reason = %description, "Not starting execution");

        let status = CommitStatus {
            verdict: Verdict::Failure,
            context: manifest
                .and_then(peek_checks_name)
                .unwrap_or_else(|| DEFAULT_CHECKS_NAME.to_string()),
            description,
            target_url: None,
        };
        if let Err(e) = self.reporter.push_commit_status(target, &status).await {
            warn!(repo = %target.repo_id, error = %e, "Failed to push setup failure status");
        }
    }

    /// Allocate the execution id and persist the initial state. Runs under the lock.
    async fn initialize(
        &self,
        request: &StartRequest<'_>,
        resolved: &ResolvedManifest,
        commit_sha: &str,
        trace_id: TraceId,
        target: ReportTarget,
    ) -> SchedulerResult<ExecutionState> {
        let repo_id = request.repo_id;
        let execution_id = self.sequencer.next_id(repo_id, commit_sha).await?;
        let repo = self
            .config
            .repo(repo_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("repository {}", repo_id)))?;

        let mut builds: Vec<BuildState> = resolved
            .builds
            .iter()
            .map(|spec| BuildState::new(spec.clone()))
            .collect();
        if let Some(branch) = request.branch {
            skip_for_branch(&mut builds, branch);
        }

        let mut state = ExecutionState {
            is_running: true,
            stop_requested: false,
            wait_seconds: self.config.wait_seconds_for(repo),
            repo_id: repo_id.clone(),
            installation_id: target.installation_id,
            execution_id: execution_id.clone(),
            trace_id,
            commit_sha: commit_sha.to_string(),
            checks_name: resolved.checks_name.clone(),
            report_id: None,
            credential: None,
            sources_uploaded: BTreeSet::new(),
            builds,
        };
        state.is_running = state.compute_is_running();

        let now = self.clock.now();
        if self.config.use_checks && state.installation_id.is_some() {
            let report = AggregateReport {
                name: state.checks_name.clone(),
                external_id: long_execution_id(repo_id, &execution_id),
                status: ReportStatus::Queued,
                title: "Queued".to_string(),
                summary: summary::render_summary(&state, &self.config.base_url, now),
                actions: vec![ReportAction::stop()],
            };
            match self.reporter.upsert_report(&target, None, &report).await {
                Ok(id) => state.report_id = Some(id),
                Err(e) => warn!(execution = %execution_id, error = %e, "Failed to create report"),
            }
        }

        let record = ExecutionRecord {
            repo_id: repo_id.clone(),
            execution_id,
            trace_id,
            status: ExecutionStatus::Queued,
            conclusion: None,
            meta: ExecutionMeta {
                trigger: request.trigger.clone(),
                commit: request.commit.clone(),
                stop: None,
                error: None,
            },
            state: state.clone(),
            created_at: now,
            updated_at: now,
            conclusion_at: None,
        };
        self.executions
            .create(&record)
            .await
            .map_err(SchedulerError::Store)?;

        Ok(state)
    }

    /// Record a stop request for a running execution. The next step acts on it.
    pub async fn stop(&self, repo_id: &RepoId, id: &ExecutionId, user: &str) -> SchedulerResult<()> {
        let record = self
            .executions
            .get(repo_id, id)
            .await
            .map_err(SchedulerError::Store)?
            .ok_or_else(|| SchedulerError::NotFound(format!("execution {}", id)))?;

        if record.status == ExecutionStatus::Completed || !record.state.is_running {
            return Err(SchedulerError::NotRunning(id.to_string()));
        }
        if record.meta.stop.is_some() || record.state.stop_requested {
            return Err(SchedulerError::AlreadyStopping(id.to_string()));
        }

        let stop = StopRequest {
            user: user.to_string(),
            requested_at: self.clock.now(),
        };
        self.executions
            .request_stop(repo_id, id, &stop)
            .await
            .map_err(SchedulerError::Store)?;
        info!(repo = %repo_id, execution = %id, user = %user, "Stop requested");
        Ok(())
    }
}

/// Skip builds whose branch patterns do not match `branch`, then every build
/// depending on a skipped one, transitively.
fn skip_for_branch(builds: &mut [BuildState], branch: &str) {
    let mut skipped = BTreeSet::new();
    for build in builds.iter_mut() {
        if !branch_matches(&build.spec.branches, branch) {
            info!(build = %build.key, branch = %branch, "Skipping build for branch");
            build.status = Some(BuildStatus::Skipped);
            skipped.insert(build.key.clone());
        }
    }

    let mut changed = !skipped.is_empty();
    while changed {
        changed = false;
        for build in builds.iter_mut().filter(|b| b.status.is_none()) {
            if let Some(dependency) = build.spec.depends_on.iter().find(|d| skipped.contains(*d)) {
                info!(build = %build.key, dependency = %dependency, "Skipping build with skipped dependency");
                build.status = Some(BuildStatus::Skipped);
                skipped.insert(build.key.clone());
                changed = true;
            }
        }
    }
}
