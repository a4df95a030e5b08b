//! Source stager writing commit archives to a local staging directory.
//!
//! Archives land at `{staging_dir}/{bucket}/{key}`; the Docker driver mounts
//! `{staging_dir}/{bucket}` into its containers.

use async_trait::async_trait;
use cbuild_core::auth::TokenSource;
use cbuild_core::driver::{SourceArchive, SourceStager};
use cbuild_core::id::RepoId;
use cbuild_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("cbuild/", env!("CARGO_PKG_VERSION"));

/// Downloads the commit tarball from the hosting platform's API.
pub struct LocalSourceStager {
    client: reqwest::Client,
    api_url: String,
    staging_dir: PathBuf,
    tokens: Arc<dyn TokenSource>,
}

impl LocalSourceStager {
    pub fn new(
        api_url: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            staging_dir: staging_dir.into(),
            tokens,
        }
    }

    fn tarball_url(&self, repo_id: &RepoId, commit_sha: &str) -> String {
        format!(
            "{}/repos/{}/{}/tarball/{}",
            self.api_url,
            repo_id.owner(),
            repo_id.name(),
            commit_sha
        )
    }

    /// Local path of an archive, refusing keys that would escape the staging dir.
    pub fn archive_path(&self, destination: &SourceArchive) -> Result<PathBuf> {
        let relative = Path::new(&destination.bucket).join(&destination.key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!(
                "archive destination {} is not a plain relative path",
                destination.dedupe_key()
            )));
        }
        Ok(self.staging_dir.join(relative))
    }
}

#[async_trait]
impl SourceStager for LocalSourceStager {
    async fn ensure_uploaded(
        &self,
        repo_id: &RepoId,
        commit_sha: &str,
        installation_id: Option<i64>,
        destination: &SourceArchive,
    ) -> Result<()> {
        let path = self.archive_path(destination)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Source archive already staged");
            return Ok(());
        }

        let url = self.tarball_url(repo_id, commit_sha);
        info!(repo = %repo_id, commit = %commit_sha, "Downloading source archive");

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = self.tokens.token(installation_id).await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("Failed to download {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ExecutionFailed(format!(
                "Downloading {} returned {}",
                url, status
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Unavailable(format!("Failed to read {}: {}", url, e)))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        // Write then rename so a job never sees a partial archive.
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &body)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!(path = %path.display(), bytes = body.len(), "Source archive staged");
        Ok(())
    }
}
