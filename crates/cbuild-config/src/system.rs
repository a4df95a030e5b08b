//! System configuration parsing (`cbuild-server.kdl`).
//!
//! ```kdl
//! base-url "https://ci.example.com"
//! lock-timeout-seconds 900
//! wait-seconds 15
//!
//! defaults {
//!     source-bucket "cbuild-sources"
//! }
//!
//! repo "github.com/acme/widgets" {
//!     allow-project "default"
//!     webhook-secret "s3cret"
//!     installation-id 1234
//! }
//! ```

use cbuild_core::RepoId;
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::manifest::BuildFields;
use crate::nodes::{get_bool, get_integer, get_string};
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_MANIFEST_FILE: &str = "cbuild.kdl";
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 900;
/// One week.
pub const MAX_LOCK_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_WAIT_SECONDS: u64 = 15;
pub const MIN_WAIT_SECONDS: u64 = 10;
pub const MAX_WAIT_SECONDS: u64 = 120;

/// System-wide configuration.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Public URL of this server, used for build links.
    pub base_url: String,
    pub github_url: String,
    pub github_api_url: String,
    /// Manifest file name at the repository root.
    pub manifest_file: String,
    /// Seconds after which an unrefreshed lock may be taken over.
    pub lock_timeout_seconds: u64,
    /// Default seconds between orchestration steps.
    pub wait_seconds: u64,
    /// Whether to maintain an aggregate check run per execution.
    pub use_checks: bool,
    /// Where source archives are staged for jobs.
    pub staging_dir: PathBuf,
    /// Global build defaults, the lowest layer.
    pub defaults: BuildFields,
    pub repos: BTreeMap<RepoId, RepoConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            github_url: "https://github.com".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            lock_timeout_seconds: DEFAULT_LOCK_TIMEOUT_SECONDS,
            wait_seconds: DEFAULT_WAIT_SECONDS,
            use_checks: true,
            staging_dir: PathBuf::from("/var/lib/cbuild/staging"),
            defaults: BuildFields::default(),
            repos: BTreeMap::new(),
        }
    }
}

impl SystemConfig {
    pub fn repo(&self, repo_id: &RepoId) -> Option<&RepoConfig> {
        self.repos.get(repo_id)
    }

    /// Step interval for a repository.
    pub fn wait_seconds_for(&self, repo: &RepoConfig) -> u64 {
        repo.wait_seconds.unwrap_or(self.wait_seconds)
    }
}

/// Per-repository configuration.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub repo_id: RepoId,
    /// Job targets builds of this repository may use.
    pub allowed_projects: Vec<String>,
    pub wait_seconds: Option<u64>,
    /// Secret for webhook signature verification.
    pub webhook_secret: Option<String>,
    /// GitHub App installation for this repository.
    pub installation_id: Option<i64>,
    pub defaults: BuildFields,
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        let name = node.name().value();
        match name {
            "base-url" => config.base_url = parse_url(node, name)?,
            "github-url" => config.github_url = parse_url(node, name)?,
            "github-api-url" => config.github_api_url = parse_url(node, name)?,
            "manifest-file" => {
                config.manifest_file = get_string(node, name)?;
                if config.manifest_file.is_empty() {
                    return Err(ConfigError::invalid(name, "must have a value"));
                }
            }
            "lock-timeout-seconds" => {
                let value = positive(get_integer(node, name)?, name)?;
                if value > MAX_LOCK_TIMEOUT_SECONDS {
                    return Err(ConfigError::invalid(
                        name,
                        format!("must be at most {}", MAX_LOCK_TIMEOUT_SECONDS),
                    ));
                }
                config.lock_timeout_seconds = value;
            }
            "wait-seconds" => config.wait_seconds = wait_seconds(node, name)?,
            "use-checks" => config.use_checks = get_bool(node, name)?,
            "staging-dir" => config.staging_dir = PathBuf::from(get_string(node, name)?),
            "defaults" => config.defaults = BuildFields::parse(node, "defaults")?,
            "repo" => {
                let repo = parse_repo(node)?;
                if config.repos.contains_key(&repo.repo_id) {
                    return Err(ConfigError::Duplicate(format!("repo.{}", repo.repo_id)));
                }
                config.repos.insert(repo.repo_id.clone(), repo);
            }
            other => return Err(ConfigError::invalid(other, "is not a known setting")),
        }
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn parse_repo(node: &KdlNode) -> ConfigResult<RepoConfig> {
    let raw_id = get_string(node, "repo")?;
    let repo_id: RepoId = raw_id
        .parse()
        .map_err(|_| ConfigError::invalid(format!("repo.{}", raw_id), "must be a valid repo ID"))?;
    let path = format!("repo.{}", repo_id);

    let mut repo = RepoConfig {
        repo_id,
        allowed_projects: Vec::new(),
        wait_seconds: None,
        webhook_secret: None,
        installation_id: None,
        defaults: BuildFields::default(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            let field = format!("{}.{}", path, name);
            match name {
                "allow-project" => {
                    let project = get_string(child, &field)?;
                    if project.is_empty() {
                        return Err(ConfigError::invalid(field, "must have a value"));
                    }
                    repo.allowed_projects.push(project);
                }
                "wait-seconds" => repo.wait_seconds = Some(wait_seconds(child, &field)?),
                "webhook-secret" => repo.webhook_secret = Some(get_string(child, &field)?),
                "installation-id" => repo.installation_id = Some(get_integer(child, &field)?),
                "defaults" => repo.defaults = BuildFields::parse(child, &field)?,
                _ => return Err(ConfigError::invalid(field, "is not a known repo setting")),
            }
        }
    }

    if repo.allowed_projects.is_empty() {
        return Err(ConfigError::MissingField(format!("{}.allow-project", path)));
    }

    Ok(repo)
}

fn parse_url(node: &KdlNode, path: &str) -> ConfigResult<String> {
    let value = get_string(node, path)?;
    url::Url::parse(&value).map_err(|e| ConfigError::invalid(path, format!("must be a URL: {}", e)))?;
    Ok(value.trim_end_matches('/').to_string())
}

fn positive(value: i64, path: &str) -> ConfigResult<u64> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::invalid(path, "must be a positive integer"))
}

fn wait_seconds(node: &KdlNode, path: &str) -> ConfigResult<u64> {
    let value = positive(get_integer(node, path)?, path)?;
    if !(MIN_WAIT_SECONDS..=MAX_WAIT_SECONDS).contains(&value) {
        return Err(ConfigError::invalid(
            path,
            format!("must be between {} and {}", MIN_WAIT_SECONDS, MAX_WAIT_SECONDS),
        ));
    }
    Ok(value)
}
