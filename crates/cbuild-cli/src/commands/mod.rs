//! CLI command implementations.

pub mod executions;

use anyhow::{Context, Result};
use cbuild_config::manifest::parse_manifest_file;
use cbuild_config::system::load_system_config;
use cbuild_config::{ResolveContext, ResolvedManifest, SystemConfig, VariableContext};
use cbuild_core::id::RepoId;
use std::path::Path;

pub fn validate(path: &str, config: Option<&str>, repo: &str, commit: &str) -> Result<()> {
    let system = match config {
        Some(config) => load_system_config(Path::new(config))
            .with_context(|| format!("Failed to load system config: {}", config))?,
        None => SystemConfig::default(),
    };
    let repo_id: RepoId = repo.parse()?;

    let resolved = resolve(Path::new(path), &system, &repo_id, commit)
        .with_context(|| format!("Configuration error in {}", path))?;

    println!("Configuration is valid");
    println!("Checks name: {}", resolved.checks_name);
    for (i, level) in resolved.graph.levels().iter().enumerate() {
        println!("  {}. {}", i + 1, level.join(", "));
    }
    Ok(())
}

fn resolve(
    path: &Path,
    system: &SystemConfig,
    repo_id: &RepoId,
    commit: &str,
) -> Result<ResolvedManifest> {
    let manifest = parse_manifest_file(path)?;
    let variables = VariableContext::new(repo_id.clone(), commit);

    let mut defaults = vec![&system.defaults];
    let mut allowed_projects = None;
    if let Some(repo) = system.repo(repo_id) {
        defaults.push(&repo.defaults);
        allowed_projects = Some(repo.allowed_projects.as_slice());
    }

    let resolved = manifest.resolve(&ResolveContext {
        defaults,
        allowed_projects,
        variables: &variables,
    })?;
    Ok(resolved)
}
