//! Job driver and source stager traits.
//!
//! A job driver runs one build as an external job (a container, a managed
//! build service project, ...). The orchestration engine only ever talks to
//! it through `start`, `batch_poll` and `stop`.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::build::{JobInfo, JobParams};
use crate::id::{RepoId, TraceId};
use crate::Result;

/// Request to start the job for one build.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub trace_id: TraceId,
    pub build_key: String,
    pub params: JobParams,
    /// Where the staged source archive lives.
    pub source: SourceArchive,
    /// Full environment for the job, reserved variables first.
    pub env: BTreeMap<String, String>,
}

/// Destination of a commit's source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    pub bucket: String,
    pub key: String,
}

impl SourceArchive {
    /// Archive for `commit` under a resolved key prefix.
    pub fn for_commit(bucket: &str, key_prefix: &str, commit: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: format!("{}source_{}.tar.gz", key_prefix, commit),
        }
    }

    /// Key used to stage each destination once per execution.
    pub fn dedupe_key(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// Trait for job drivers.
#[async_trait]
pub trait JobDriver: Send + Sync {
    /// Name of this driver.
    fn name(&self) -> &'static str;

    /// Start a job. The returned info carries the driver's job id.
    async fn start(&self, request: &JobRequest) -> Result<JobInfo>;

    /// Poll several jobs in one call. Ids the driver no longer knows are
    /// omitted from the result.
    async fn batch_poll(&self, job_ids: &[String]) -> Result<Vec<JobInfo>>;

    /// Request that a job stop.
    async fn stop(&self, job_id: &str) -> Result<()>;
}

/// Stages a commit's source archive where jobs can fetch it.
#[async_trait]
pub trait SourceStager: Send + Sync {
    /// Download with the token of `installation_id`, the execution's
    /// platform installation.
    async fn ensure_uploaded(
        &self,
        repo_id: &RepoId,
        commit_sha: &str,
        installation_id: Option<i64>,
        destination: &SourceArchive,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_archive_key() {
        let archive = SourceArchive::for_commit("sources", "acme/widgets/", "abc123");
        assert_eq!(archive.key, "acme/widgets/source_abc123.tar.gz");
        assert_eq!(archive.dedupe_key(), "sources/acme/widgets/source_abc123.tar.gz");
    }
}
