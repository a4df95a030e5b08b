//! Docker job driver.
//!
//! Each build runs in one container named after the execution's trace id and
//! the build key. The container unpacks the staged source archive into
//! `/workspace` and runs the build commands there. Containers are left behind
//! after they exit so `docker logs` keeps working.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerState, HostConfig};
use cbuild_core::build::{BuildStatus, JobInfo};
use cbuild_core::driver::{JobDriver, JobRequest};
use cbuild_core::{Error, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const LABEL_REPO: &str = "cbuild.repo";
const LABEL_BUILD: &str = "cbuild.build";
const LABEL_TRACE: &str = "cbuild.trace-id";
const LABEL_TIMEOUT: &str = "cbuild.timeout-minutes";

const SOURCE_MOUNT: &str = "/cbuild/source";
const WORKSPACE: &str = "/workspace";

/// Seconds docker waits after SIGTERM before killing a stopped container.
const STOP_GRACE_SECONDS: i64 = 10;

/// Job driver running builds as local Docker containers.
pub struct DockerJobDriver {
    docker: Docker,
    staging_dir: PathBuf,
}

impl DockerJobDriver {
    /// Connect to the local Docker daemon. `staging_dir` is where the source
    /// stager writes archives; it is bind-mounted read-only into every job.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self::with_client(docker, staging_dir))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            staging_dir: staging_dir.into(),
        }
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image cannot be pulled but may still run.
                    warn!(image = %image, error = %e, "Pull failed");
                    break;
                }
            }
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::Unavailable(format!(
                "Failed to inspect container {}: {}",
                name, e
            ))),
        }
    }
}

#[async_trait]
impl JobDriver for DockerJobDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, request: &JobRequest) -> Result<JobInfo> {
        let name = container_name(request);
        self.pull_image(&request.params.image).await;

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let labels = HashMap::from([
            (LABEL_REPO.to_string(), request.repo_id.to_string()),
            (LABEL_BUILD.to_string(), request.build_key.clone()),
            (LABEL_TRACE.to_string(), request.trace_id.to_string()),
            (
                LABEL_TIMEOUT.to_string(),
                request.params.timeout_minutes.to_string(),
            ),
        ]);

        let source_dir = self.staging_dir.join(&request.source.bucket);
        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}:ro", source_dir.display(), SOURCE_MOUNT)]),
            privileged: Some(request.params.privileged),
            ..Default::default()
        };

        let archive = format!("{}/{}", SOURCE_MOUNT, request.source.key);
        let config = Config {
            image: Some(request.params.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                job_script(&archive, &request.params.commands),
            ]),
            env: Some(env),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        info!(container = %name, build = %request.build_key, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %name, "Starting container");
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobInfo {
            id: name.clone(),
            status: BuildStatus::InProgress,
            phase: Some("running".to_string()),
            logs_ref: Some(logs_ref(&name)),
            started_at: Some(Utc::now()),
            ended_at: None,
        })
    }

    async fn batch_poll(&self, job_ids: &[String]) -> Result<Vec<JobInfo>> {
        let mut jobs = Vec::with_capacity(job_ids.len());
        let now = Utc::now();

        for id in job_ids {
            let Some(inspect) = self.inspect(id).await? else {
                debug!(container = %id, "Container not found");
                continue;
            };

            let info = job_info(id, &inspect, now);
            if info.status == BuildStatus::TimedOut {
                warn!(container = %id, "Container exceeded its timeout, stopping");
                if let Err(e) = self.stop(id).await {
                    warn!(container = %id, error = %e, "Failed to stop timed out container");
                }
            }
            jobs.push(info);
        }

        Ok(jobs)
    }

    async fn stop(&self, job_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: STOP_GRACE_SECONDS,
        };
        match self.docker.stop_container(job_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            // 304: already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to stop container: {}",
                e
            ))),
        }
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Deterministic container name for a build of an execution.
fn container_name(request: &JobRequest) -> String {
    let key: String = request
        .build_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("cbuild-{}-{}", request.trace_id, key)
}

fn logs_ref(name: &str) -> String {
    format!("docker logs {}", name)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell script that unpacks the archive and runs `commands` in order,
/// stopping at the first failure.
fn job_script(archive: &str, commands: &[String]) -> String {
    let mut steps = vec![
        format!("mkdir -p {}", WORKSPACE),
        format!(
            "tar -xzf {} -C {} --strip-components=1",
            shell_quote(archive),
            WORKSPACE
        ),
        format!("cd {}", WORKSPACE),
    ];
    steps.extend(commands.iter().map(|c| format!("( {} )", c)));
    steps.join(" && ")
}

fn parse_docker_time(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        // Docker reports the zero time for containers that never started or ended.
        .filter(|dt| dt.year() > 1)
}

/// Map an inspected container to the job info the engine tracks.
fn job_info(id: &str, inspect: &ContainerInspectResponse, now: DateTime<Utc>) -> JobInfo {
    let default_state = ContainerState::default();
    let state = inspect.state.as_ref().unwrap_or(&default_state);
    let started_at = parse_docker_time(state.started_at.as_deref());
    let mut ended_at = parse_docker_time(state.finished_at.as_deref());
    let phase = state.status.as_ref().map(|s| s.to_string());

    let timeout = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(LABEL_TIMEOUT))
        .and_then(|v| v.parse::<i64>().ok())
        .map(Duration::minutes);

    let status = if state.running.unwrap_or(false) || state.restarting.unwrap_or(false) {
        match (started_at, timeout) {
            (Some(start), Some(limit)) if now - start > limit => {
                ended_at = Some(now);
                BuildStatus::TimedOut
            }
            _ => BuildStatus::InProgress,
        }
    } else if state.oom_killed.unwrap_or(false) || state.dead.unwrap_or(false) {
        BuildStatus::Fault
    } else if ended_at.is_none() && started_at.is_none() {
        // Created but not yet running.
        BuildStatus::InProgress
    } else {
        match state.exit_code {
            Some(0) => BuildStatus::Succeeded,
            Some(137) | Some(143) => BuildStatus::Stopped,
            Some(_) => BuildStatus::Failed,
            None => BuildStatus::Fault,
        }
    };

    JobInfo {
        id: id.to_string(),
        status,
        phase,
        logs_ref: Some(logs_ref(id)),
        started_at,
        ended_at,
    }
}
