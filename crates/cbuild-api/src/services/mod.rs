//! Outbound services used by the API.

pub mod github;
pub mod token_cache;

use async_trait::async_trait;
use cbuild_core::id::RepoId;

/// Reads the build manifest committed at a commit.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Content of `path` at `commit_sha`, `None` when the file does not exist.
    async fn fetch(
        &self,
        repo: &RepoId,
        commit_sha: &str,
        path: &str,
        installation_id: Option<i64>,
    ) -> cbuild_core::Result<Option<String>>;
}
