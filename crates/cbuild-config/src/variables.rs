//! Variable interpolation for storage key prefixes.
//!
//! Supports variables like:
//! - `${repo.host}` - Repository host (e.g. `github.com`)
//! - `${repo.owner}` - Repository owner
//! - `${repo.name}` - Repository name
//! - `${commit.sha}` - Full commit SHA

use cbuild_core::RepoId;
use regex::Regex;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Values available to `${...}` variables.
#[derive(Debug, Clone)]
pub struct VariableContext {
    pub repo_id: RepoId,
    pub commit_sha: String,
}

impl VariableContext {
    pub fn new(repo_id: RepoId, commit_sha: impl Into<String>) -> Self {
        Self {
            repo_id,
            commit_sha: commit_sha.into(),
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["repo", "host"] => Some(self.repo_id.host().to_string()),
            ["repo", "owner"] => Some(self.repo_id.owner().to_string()),
            ["repo", "name"] => Some(self.repo_id.name().to_string()),
            ["commit", "sha"] => Some(self.commit_sha.clone()),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as is.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }
}

/// Variable names used in `input` that are not supported.
pub fn unknown_variables(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .filter(|name| {
            !matches!(
                name.as_str(),
                "repo.host" | "repo.owner" | "repo.name" | "commit.sha"
            )
        })
        .collect()
}
