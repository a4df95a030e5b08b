//! Orchestration engine.
//!
//! The engine advances an [`ExecutionState`] one step at a time. Each step is
//! a complete unit over the state it is given: it refreshes the commit lock,
//! polls the jobs in flight, starts builds whose dependencies succeeded,
//! persists the state and reports progress. The runner calls `step` again
//! while the state says it is running, then `finish`.

use cbuild_core::build::{BuildSpec, BuildStatus, JobInfo};
use cbuild_core::clock::Clock;
use cbuild_core::driver::{JobDriver, JobRequest, SourceArchive, SourceStager};
use cbuild_core::execution::{Conclusion, ExecutionState};
use cbuild_core::id::long_execution_id;
use cbuild_core::reporter::{
    AggregateReport, CommitStatus, ReportAction, ReportStatus, StatusReporter, commit_verdict,
};
use cbuild_core::store::ExecutionStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lock::LockManager;
use crate::summary;

pub struct Engine {
    locks: Arc<LockManager>,
    executions: Arc<dyn ExecutionStore>,
    driver: Arc<dyn JobDriver>,
    stager: Arc<dyn SourceStager>,
    reporter: Arc<dyn StatusReporter>,
    clock: Arc<dyn Clock>,
    base_url: String,
}

impl Engine {
    pub fn new(
        locks: Arc<LockManager>,
        executions: Arc<dyn ExecutionStore>,
        driver: Arc<dyn JobDriver>,
        stager: Arc<dyn SourceStager>,
        reporter: Arc<dyn StatusReporter>,
        clock: Arc<dyn Clock>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            locks,
            executions,
            driver,
            stager,
            reporter,
            clock,
            base_url: base_url.into(),
        }
    }

    /// Advance the execution by one step.
    ///
    /// Only losing the commit lock or failing to persist the state is an
    /// error; anything going wrong with a single build ends that build.
    pub async fn step(&self, mut state: ExecutionState) -> SchedulerResult<ExecutionState> {
        self.locks
            .refresh(&state.lock_id(), &state.trace_id)
            .await?;

        let ended = self.poll_in_progress(&mut state).await;
        for key in &ended {
            self.push_build_status(&state, key).await;
        }

        if !state.stop_requested {
            self.advance_pending(&mut state).await;
        }

        state.is_running = state.compute_is_running();
        if !state.is_running {
            info!(execution = %state.execution_id, "All builds for execution complete");
        }

        let stop = self
            .executions
            .save_state(&state, self.clock.now())
            .await
            .map_err(SchedulerError::Persist)?;

        if let Some(stop) = stop {
            if state.is_running && !state.stop_requested {
                info!(execution = %state.execution_id, user = %stop.user, "Execution stop requested");
                state.stop_requested = true;
                self.stop_in_progress(&state).await;
            }
        }

        if state.is_running {
            let title = if state.stop_requested {
                "Stopping..."
            } else {
                "Running builds..."
            };
            let actions = if state.stop_requested {
                vec![]
            } else {
                vec![ReportAction::stop()]
            };
            self.update_report(&mut state, ReportStatus::InProgress, title, actions)
                .await;
        }

        Ok(state)
    }

    /// Terminal path: record the conclusion, finalize the report and release the lock.
    pub async fn finish(&self, mut state: ExecutionState) -> SchedulerResult<Conclusion> {
        state.is_running = false;
        let conclusion = state.conclusion();
        info!(execution = %state.execution_id, conclusion = conclusion.as_str(), "Execution completed");

        self.executions
            .complete(&state, conclusion, None, self.clock.now())
            .await
            .map_err(SchedulerError::Persist)?;

        let title = summary::conclusion_title(conclusion, state.tally());
        self.update_report(
            &mut state,
            ReportStatus::Completed(conclusion.into()),
            &title,
            vec![ReportAction::rerun()],
        )
        .await;

        self.locks
            .release(&state.lock_id(), &state.trace_id)
            .await;
        Ok(conclusion)
    }

    /// Error path after a fatal step failure. Everything here is best-effort.
    pub async fn fail(&self, mut state: ExecutionState, cause: &SchedulerError) {
        error!(execution = %state.execution_id, error = %cause, "Execution error");
        state.is_running = false;

        if let Err(e) = self
            .executions
            .complete(
                &state,
                Conclusion::Error,
                Some(cause.to_string()),
                self.clock.now(),
            )
            .await
        {
            error!(execution = %state.execution_id, error = %e, "Failed to record execution error");
        }

        self.update_report(
            &mut state,
            ReportStatus::Completed(Conclusion::Error.into()),
            "Internal System Error",
            vec![ReportAction::rerun()],
        )
        .await;

        // Another execution owns the lock now.
        if !matches!(cause, SchedulerError::LockLost { .. }) {
            self.locks
                .release(&state.lock_id(), &state.trace_id)
                .await;
        }
    }

    /// Poll every in-progress job in one call. Returns the keys of builds that ended.
    async fn poll_in_progress(&self, state: &mut ExecutionState) -> Vec<String> {
        let job_ids: Vec<String> = state
            .builds
            .iter()
            .filter(|b| b.is_in_progress())
            .filter_map(|b| b.job.as_ref().map(|j| j.id.clone()))
            .collect();
        if job_ids.is_empty() {
            return vec![];
        }

        let polled = match self.driver.batch_poll(&job_ids).await {
            Ok(polled) => polled,
            Err(e) => {
                warn!(execution = %state.execution_id, error = %e, "Failed to poll builds");
                return vec![];
            }
        };
        let mut polled: HashMap<String, JobInfo> =
            polled.into_iter().map(|job| (job.id.clone(), job)).collect();

        let mut ended = Vec::new();
        for build in state.builds.iter_mut().filter(|b| b.is_in_progress()) {
            let Some(job_id) = build.job.as_ref().map(|j| j.id.clone()) else {
                continue;
            };

            match polled.remove(&job_id) {
                Some(job) => {
                    let status = if job.status.is_terminal() {
                        job.status
                    } else {
                        BuildStatus::InProgress
                    };
                    build.status = Some(status);
                    build.job = Some(JobInfo { status, ..job });
                    if status != BuildStatus::InProgress {
                        info!(build = %build.key, status = %status, "Build ended");
                        ended.push(build.key.clone());
                    }
                }
                None => {
                    warn!(build = %build.key, job = %job_id, "Job not found");
                    build.status = Some(BuildStatus::BuildNotFound);
                    ended.push(build.key.clone());
                }
            }
        }
        ended
    }

    /// Walk builds that have not started, in manifest order.
    async fn advance_pending(&self, state: &mut ExecutionState) {
        for idx in 0..state.builds.len() {
            if !state.builds[idx].is_pending() {
                continue;
            }

            let mut waiting = Vec::new();
            let mut failed = false;
            for dep in &state.builds[idx].spec.depends_on {
                match state.status_of(dep) {
                    None
                    | Some(BuildStatus::WaitingForDependency)
                    | Some(BuildStatus::Starting)
                    | Some(BuildStatus::InProgress) => waiting.push(dep.clone()),
                    Some(BuildStatus::Succeeded) => {}
                    Some(_) => failed = true,
                }
            }

            let key = state.builds[idx].key.clone();
            if failed {
                info!(build = %key, "Dependency failed");
                let build = &mut state.builds[idx];
                build.status = Some(BuildStatus::DependencyFailed);
                build.waiting_for.clear();
                self.push_build_status(state, &key).await;
            } else if !waiting.is_empty() {
                debug!(build = %key, waiting_for = ?waiting, "Waiting on dependencies");
                let build = &mut state.builds[idx];
                let first_wait = build.status.is_none();
                build.status = Some(BuildStatus::WaitingForDependency);
                build.waiting_for = waiting;
                if first_wait {
                    self.push_build_status(state, &key).await;
                }
            } else {
                state.builds[idx].waiting_for.clear();
                self.start_build(state, idx).await;
            }
        }
    }

    async fn start_build(&self, state: &mut ExecutionState, idx: usize) {
        let key = state.builds[idx].key.clone();
        info!(build = %key, "Starting build");
        state.builds[idx].status = Some(BuildStatus::Starting);
        self.push_build_status(state, &key).await;

        match self.launch(state, idx).await {
            Ok(job) => {
                let status = if job.status.is_terminal() {
                    job.status
                } else {
                    BuildStatus::InProgress
                };
                info!(build = %key, job = %job.id, "Started build");
                let build = &mut state.builds[idx];
                build.status = Some(status);
                build.job = Some(JobInfo { status, ..job });
            }
            Err(e) => {
                error!(build = %key, error = %e, "Failed to start build");
                state.builds[idx].status = Some(BuildStatus::StartFailed);
            }
        }
        self.push_build_status(state, &key).await;
    }

    /// Stage the source archive once per destination, then start the job.
    async fn launch(&self, state: &mut ExecutionState, idx: usize) -> cbuild_core::Result<JobInfo> {
        let spec = &state.builds[idx].spec;
        let source = SourceArchive::for_commit(
            &spec.job.source.bucket,
            &spec.job.source.key_prefix,
            &state.commit_sha,
        );
        let request = JobRequest {
            repo_id: state.repo_id.clone(),
            commit_sha: state.commit_sha.clone(),
            trace_id: state.trace_id,
            build_key: spec.key.clone(),
            params: spec.job.clone(),
            source: source.clone(),
            env: job_env(state, spec),
        };

        let dedupe_key = source.dedupe_key();
        if !state.sources_uploaded.contains(&dedupe_key) {
            info!(destination = %dedupe_key, "Staging source archive");
            self.stager
                .ensure_uploaded(
                    &state.repo_id,
                    &state.commit_sha,
                    state.installation_id,
                    &source,
                )
                .await?;
            state.sources_uploaded.insert(dedupe_key);
        }

        self.driver.start(&request).await
    }

    async fn stop_in_progress(&self, state: &ExecutionState) {
        for build in state.builds.iter().filter(|b| b.is_in_progress()) {
            let Some(job) = &build.job else { continue };
            info!(build = %build.key, job = %job.id, "Stopping build");
            if let Err(e) = self.driver.stop(&job.id).await {
                warn!(build = %build.key, error = %e, "Failed to stop build");
            }
        }
    }

    /// Push the per-build commit status, if the build reports one.
    async fn push_build_status(&self, state: &ExecutionState, key: &str) {
        let Some(build) = state.build(key) else { return };
        let Some(context) = &build.spec.commit_status else {
            return;
        };

        let (verdict, description) = commit_verdict(build.status);
        let status = CommitStatus {
            verdict,
            context: context.clone(),
            description: description.to_string(),
            target_url: Some(summary::build_url(&self.base_url, state, key)),
        };

        debug!(build = %key, context = %context, verdict = verdict.as_str(), "Pushing commit status");
        if let Err(e) = self
            .reporter
            .push_commit_status(&state.report_target(), &status)
            .await
        {
            warn!(build = %key, error = %e, "Failed to push commit status");
        }
    }

    /// Update the aggregate report, if the execution has one.
    async fn update_report(
        &self,
        state: &mut ExecutionState,
        status: ReportStatus,
        title: &str,
        actions: Vec<ReportAction>,
    ) {
        if state.report_id.is_none() {
            return;
        }

        let report = AggregateReport {
            name: state.checks_name.clone(),
            external_id: long_execution_id(&state.repo_id, &state.execution_id),
            status,
            title: title.to_string(),
            summary: summary::render_summary(state, &self.base_url, self.clock.now()),
            actions,
        };

        match self
            .reporter
            .upsert_report(&state.report_target(), state.report_id, &report)
            .await
        {
            Ok(id) => state.report_id = Some(id),
            Err(e) => warn!(execution = %state.execution_id, error = %e, "Failed to update report"),
        }
    }
}

/// Environment of a build's job: the reserved `CBUILD_` variables followed
/// by the build's own. Empty values are dropped.
pub fn job_env(state: &ExecutionState, spec: &BuildSpec) -> BTreeMap<String, String> {
    let job = &spec.job;
    let artifacts = job.artifacts.as_ref();
    let trace_id = state.trace_id.to_string();

    let reserved = [
        ("CBUILD_COMMIT_SHA", Some(state.commit_sha.as_str())),
        ("CBUILD_TRACE_ID", Some(trace_id.as_str())),
        ("CBUILD_SOURCE_BUCKET", Some(job.source.bucket.as_str())),
        ("CBUILD_SOURCE_KEY_PREFIX", Some(job.source.key_prefix.as_str())),
        ("CBUILD_ARTIFACT_BUCKET", artifacts.map(|a| a.bucket.as_str())),
        ("CBUILD_ARTIFACT_KEY_PREFIX", artifacts.map(|a| a.key_prefix.as_str())),
    ];

    reserved
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.to_string())))
        .chain(job.env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, Harness, RecordingReporter, execution_state, spec};
    use cbuild_core::build::StorageLocation;
    use cbuild_core::execution::{ExecutionStatus, StopRequest};
    use cbuild_core::reporter::{ReportConclusion, Verdict};
    use cbuild_core::store::LockStore;

    fn abc() -> ExecutionState {
        execution_state(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a", "b"]),
        ])
    }

    #[tokio::test]
    async fn test_dependency_chain_runs_in_order() {
        let h = Harness::new();
        let state = abc();
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["a"]);
        assert_eq!(state.status_of("a"), Some(BuildStatus::InProgress));
        assert_eq!(
            state.status_of("b"),
            Some(BuildStatus::WaitingForDependency)
        );
        assert_eq!(state.build("c").unwrap().waiting_for, vec!["a", "b"]);
        assert!(state.is_running);

        // Nothing changes while a is still running.
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["a"]);

        h.driver.finish("a", BuildStatus::Succeeded);
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["a", "b"]);
        assert_eq!(state.status_of("a"), Some(BuildStatus::Succeeded));
        assert_eq!(state.build("c").unwrap().waiting_for, vec!["b"]);

        h.driver.finish("b", BuildStatus::Succeeded);
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["a", "b", "c"]);
        assert!(state.is_running);

        h.driver.finish("c", BuildStatus::Succeeded);
        let state = h.engine.step(state).await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.status_of("c"), Some(BuildStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_waiting_reported_once() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &["a"])]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        let state = h.engine.step(state).await.unwrap();
        h.engine.step(state).await.unwrap();

        assert_eq!(
            h.reporter.descriptions("b"),
            vec!["Waiting for dependency..."]
        );
        assert_eq!(h.reporter.descriptions("a"), vec!["Starting...", "Running..."]);
    }

    #[tokio::test]
    async fn test_start_called_once_when_dependencies_succeeded() {
        let h = Harness::new();
        let mut state = execution_state(vec![spec("a", &[]), spec("b", &["a"])]);
        state.builds[0].status = Some(BuildStatus::Succeeded);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["b"]);
        let b = state.build("b").unwrap();
        assert_eq!(b.status, Some(BuildStatus::InProgress));
        assert_eq!(b.job.as_ref().unwrap().id, FakeDriver::job_id("b"));
    }

    #[tokio::test]
    async fn test_mixed_dependencies_fail_without_starting() {
        let h = Harness::new();
        let mut state = execution_state(vec![
            spec("ok", &[]),
            spec("broken", &[]),
            spec("after", &["ok", "broken"]),
        ]);
        state.builds[0].status = Some(BuildStatus::Succeeded);
        state.builds[1].status = Some(BuildStatus::Failed);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(
            state.status_of("after"),
            Some(BuildStatus::DependencyFailed)
        );
        assert!(h.driver.started_keys().is_empty());
        assert_eq!(h.reporter.descriptions("after"), vec!["Dependency failed"]);
        assert!(!state.is_running);
    }

    #[tokio::test]
    async fn test_failed_dependency_wins_over_waiting() {
        let h = Harness::new();
        let mut state = execution_state(vec![
            spec("slow", &[]),
            spec("broken", &[]),
            spec("after", &["slow", "broken"]),
        ]);
        state.builds[1].status = Some(BuildStatus::TimedOut);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(
            state.status_of("after"),
            Some(BuildStatus::DependencyFailed)
        );
        assert_eq!(h.driver.started_keys(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_missing_job_is_build_not_found() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &["a"])]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        h.driver.lose("a");
        let state = h.engine.step(state).await.unwrap();

        assert_eq!(state.status_of("a"), Some(BuildStatus::BuildNotFound));
        assert_eq!(
            state.status_of("b"),
            Some(BuildStatus::DependencyFailed)
        );
        assert_eq!(h.reporter.descriptions("a").last().unwrap(), "Failed");
        assert!(!state.is_running);
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_builds_in_progress() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        h.driver.fail_polls(true);
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(state.status_of("a"), Some(BuildStatus::InProgress));
        assert!(state.is_running);

        h.driver.fail_polls(false);
        h.driver.finish("a", BuildStatus::Failed);
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(state.status_of("a"), Some(BuildStatus::Failed));
        assert_eq!(h.driver.polls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_degrades_single_build() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &[])]);
        h.seed(&state).await;
        h.driver.fail_start_of("a");

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(state.status_of("a"), Some(BuildStatus::StartFailed));
        assert_eq!(state.status_of("b"), Some(BuildStatus::InProgress));
        assert_eq!(h.reporter.descriptions("a"), vec!["Starting...", "Failed"]);
    }

    #[tokio::test]
    async fn test_staging_failure_is_start_failure() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &["a"])]);
        h.seed(&state).await;
        h.stager.fail_uploads(true);

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(state.status_of("a"), Some(BuildStatus::StartFailed));
        assert!(state.sources_uploaded.is_empty());
        assert!(h.driver.started_keys().is_empty());
    }

    #[tokio::test]
    async fn test_source_staged_once_per_destination() {
        let h = Harness::new();
        let mut other = spec("c", &[]);
        other.job.source = StorageLocation {
            bucket: "other".to_string(),
            key_prefix: String::new(),
        };
        let state = execution_state(vec![spec("a", &[]), spec("b", &[]), other]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(h.driver.started_keys(), vec!["a", "b", "c"]);
        assert_eq!(
            *h.stager.uploads.lock().unwrap(),
            vec![
                "sources/acme/widgets/source_abc123.tar.gz".to_string(),
                "other/source_abc123.tar.gz".to_string(),
            ]
        );
        assert_eq!(state.sources_uploaded.len(), 2);

        let request = &h.driver.started.lock().unwrap()[0];
        assert_eq!(request.source.key, "acme/widgets/source_abc123.tar.gz");
    }

    #[tokio::test]
    async fn test_source_staged_with_execution_installation() {
        let h = Harness::new();
        let mut state = execution_state(vec![spec("a", &[])]);
        state.installation_id = Some(31);
        h.seed(&state).await;

        h.engine.step(state).await.unwrap();
        assert_eq!(*h.stager.installations.lock().unwrap(), vec![Some(31)]);
    }

    #[tokio::test]
    async fn test_lock_lost_is_fatal_and_leaves_builds_untouched() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;
        h.lock_store
            .release(&state.lock_id(), &state.trace_id)
            .await
            .unwrap();

        let err = h.engine.step(state.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LockLost { .. }));
        assert!(h.driver.started_keys().is_empty());
        assert!(h.reporter.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_fatal() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        // Lock held, but no execution record to save into.
        h.locks
            .acquire(&state.lock_id(), &state.trace_id)
            .await
            .unwrap();

        let err = h.engine.step(state).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Persist(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_reporting_failures_do_not_block_progress() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;
        h.reporter.fail_all(true);

        let state = h.engine.step(state).await.unwrap();
        assert_eq!(state.status_of("a"), Some(BuildStatus::InProgress));
        assert_eq!(state.report_id, Some(RecordingReporter::REPORT_ID));
    }

    #[tokio::test]
    async fn test_stop_request_stops_in_progress_jobs() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &["a"])]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        h.executions
            .request_stop(
                &state.repo_id,
                &state.execution_id,
                &StopRequest {
                    user: "sam".to_string(),
                    requested_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let state = h.engine.step(state).await.unwrap();
        assert!(state.stop_requested);
        assert!(state.is_running);
        assert_eq!(*h.driver.stopped.lock().unwrap(), vec![FakeDriver::job_id("a")]);
        let report = h.reporter.last_report().unwrap();
        assert_eq!(report.title, "Stopping...");
        assert!(report.actions.is_empty());

        // Pending builds are left alone once stopping.
        h.driver.finish("a", BuildStatus::Stopped);
        let state = h.engine.step(state).await.unwrap();
        assert_eq!(
            state.status_of("b"),
            Some(BuildStatus::WaitingForDependency)
        );
        assert!(!state.is_running);
        assert_eq!(h.driver.started_keys(), vec!["a"]);
        assert_eq!(h.driver.stopped.lock().unwrap().len(), 1);

        let conclusion = h.engine.finish(state).await.unwrap();
        assert_eq!(conclusion, Conclusion::Stopped);
        let report = h.reporter.last_report().unwrap();
        assert_eq!(report.title, "Stopped by User");
        assert_eq!(
            report.status,
            ReportStatus::Completed(ReportConclusion::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_progress_report() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;

        h.engine.step(state).await.unwrap();
        let report = h.reporter.last_report().unwrap();
        assert_eq!(report.status, ReportStatus::InProgress);
        assert_eq!(report.title, "Running builds...");
        assert_eq!(report.actions, vec![ReportAction::stop()]);
        assert_eq!(report.external_id, "github.com/acme/widgets/abc123/0001");
        assert!(report.summary.contains("| [a](https://ci.example.com/api/v1/repo/"));
    }

    #[tokio::test]
    async fn test_finish_records_conclusion_and_releases_lock() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[]), spec("b", &[])]);
        h.seed(&state).await;

        let state = h.engine.step(state).await.unwrap();
        h.driver.finish("a", BuildStatus::Succeeded);
        h.driver.finish("b", BuildStatus::Failed);
        let state = h.engine.step(state).await.unwrap();
        assert!(!state.is_running);

        let lock_id = state.lock_id();
        let conclusion = h.engine.finish(state.clone()).await.unwrap();
        assert_eq!(conclusion, Conclusion::Failed);

        let record = h
            .executions
            .get(&state.repo_id, &state.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.conclusion, Some(Conclusion::Failed));
        assert!(h.lock_store.get(&lock_id).await.unwrap().is_none());

        let report = h.reporter.last_report().unwrap();
        assert_eq!(report.title, "1 build failed");
        assert_eq!(report.actions, vec![ReportAction::rerun()]);
        assert_eq!(h.reporter.descriptions("b").last().unwrap(), "Failed");
        let verdicts: Vec<Verdict> = h
            .reporter
            .statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.context == "a")
            .map(|s| s.verdict)
            .collect();
        assert_eq!(
            verdicts,
            vec![Verdict::Pending, Verdict::Pending, Verdict::Success]
        );
    }

    #[tokio::test]
    async fn test_fail_keeps_lock_after_lock_lost() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;

        let lost = SchedulerError::LockLost {
            lock_id: state.lock_id(),
        };
        h.engine.fail(state.clone(), &lost).await;
        assert!(h.lock_store.get(&state.lock_id()).await.unwrap().is_some());

        let record = h
            .executions
            .get(&state.repo_id, &state.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.conclusion, Some(Conclusion::Error));
        assert!(record.meta.error.unwrap().contains("no longer held"));
        assert_eq!(
            h.reporter.last_report().unwrap().title,
            "Internal System Error"
        );
    }

    #[tokio::test]
    async fn test_fail_releases_lock_otherwise() {
        let h = Harness::new();
        let state = execution_state(vec![spec("a", &[])]);
        h.seed(&state).await;

        let cause = SchedulerError::Persist(cbuild_core::Error::Unavailable("db".to_string()));
        h.engine.fail(state.clone(), &cause).await;
        assert!(h.lock_store.get(&state.lock_id()).await.unwrap().is_none());
    }

    #[test]
    fn test_job_env() {
        let mut build = spec("a", &[]);
        build.job.env.insert("FOO".to_string(), "bar".to_string());
        build.job.env.insert("EMPTY".to_string(), String::new());
        let state = execution_state(vec![build.clone()]);

        let env = job_env(&state, &build);
        assert_eq!(env["CBUILD_COMMIT_SHA"], "abc123");
        assert_eq!(env["CBUILD_TRACE_ID"], state.trace_id.to_string());
        assert_eq!(env["CBUILD_SOURCE_BUCKET"], "sources");
        assert_eq!(env["CBUILD_SOURCE_KEY_PREFIX"], "acme/widgets/");
        assert_eq!(env["FOO"], "bar");
        assert!(!env.contains_key("EMPTY"));
        assert!(!env.contains_key("CBUILD_ARTIFACT_BUCKET"));

        build.job.artifacts = Some(StorageLocation {
            bucket: "artifacts".to_string(),
            key_prefix: String::new(),
        });
        let env = job_env(&state, &build);
        assert_eq!(env["CBUILD_ARTIFACT_BUCKET"], "artifacts");
        // Empty prefix is dropped like any empty value.
        assert!(!env.contains_key("CBUILD_ARTIFACT_KEY_PREFIX"));
    }
}
