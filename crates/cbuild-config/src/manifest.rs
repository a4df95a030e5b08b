//! Build manifest (`cbuild.kdl`) parsing and resolution.
//!
//! A manifest looks like:
//!
//! ```kdl
//! version 1
//! checks-name "CBuild"
//!
//! defaults {
//!     project "default"
//!     source-bucket "cbuild-sources"
//! }
//!
//! build "lint" {
//!     image "rust:1.85"
//!     run "cargo clippy"
//! }
//!
//! build "test" {
//!     image "rust:1.85"
//!     run "cargo test"
//!     depends-on "lint"
//!     commit-status "CBuild/test"
//! }
//! ```
//!
//! Parsing only checks shapes and types. Resolution layers the defaults
//! (global, repository, manifest, build), validates every field, expands
//! key-prefix variables and builds the dependency graph.

use cbuild_core::build::{BuildSpec, JobParams, StorageLocation};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::graph::DependencyGraph;
use crate::nodes::{get_bool, get_integer, get_string, get_string_map, get_strings, require_min_len};
use crate::variables::{VariableContext, unknown_variables};
use crate::{ConfigError, ConfigResult};

/// Name of the aggregate report when the manifest sets none.
pub const DEFAULT_CHECKS_NAME: &str = "CBuild";
/// Prefix of environment variables set by the orchestrator.
pub const RESERVED_ENV_PREFIX: &str = "CBUILD_";

pub const DEFAULT_TIMEOUT_MINUTES: i64 = 5;
pub const MIN_TIMEOUT_MINUTES: i64 = 5;
pub const MAX_TIMEOUT_MINUTES: i64 = 480;

const SUPPORTED_VERSIONS: &[i64] = &[1];

/// Build fields as written in one layer. Every field is optional so layers
/// can be merged field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildFields {
    pub project: Option<String>,
    pub image: Option<String>,
    pub run: Option<Vec<String>>,
    pub commit_status: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub timeout_minutes: Option<i64>,
    pub privileged: Option<bool>,
    pub stop_if_not_branch_head: Option<bool>,
    pub branches: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub source_bucket: Option<String>,
    pub source_key_prefix: Option<String>,
    pub artifact_bucket: Option<String>,
    pub artifact_key_prefix: Option<String>,
    pub no_artifacts: Option<bool>,
}

impl BuildFields {
    /// Parse the children of a `build` or `defaults` node.
    pub fn parse(node: &KdlNode, path: &str) -> ConfigResult<Self> {
        let mut fields = BuildFields::default();
        let Some(children) = node.children() else {
            return Ok(fields);
        };

        for child in children.nodes() {
            let name = child.name().value();
            let field = format!("{}.{}", path, name);

            match name {
                "project" => fields.project = Some(get_string(child, &field)?),
                "image" => fields.image = Some(get_string(child, &field)?),
                "run" => fields
                    .run
                    .get_or_insert_with(Vec::new)
                    .push(get_string(child, &field)?),
                "commit-status" => fields.commit_status = Some(get_string(child, &field)?),
                "depends-on" => fields
                    .depends_on
                    .get_or_insert_with(Vec::new)
                    .extend(get_strings(child, &field)?),
                "timeout-minutes" => fields.timeout_minutes = Some(get_integer(child, &field)?),
                "privileged" => fields.privileged = Some(get_bool(child, &field)?),
                "stop-if-not-branch-head" => {
                    fields.stop_if_not_branch_head = Some(get_bool(child, &field)?)
                }
                "branches" => fields.branches = Some(get_strings(child, &field)?),
                "env" => {
                    let mut env = BTreeMap::new();
                    for (key, value) in get_string_map(child, &field)? {
                        if env.insert(key.clone(), value).is_some() {
                            return Err(ConfigError::Duplicate(format!("{}.{}", field, key)));
                        }
                    }
                    fields.env = Some(env);
                }
                "source-bucket" => fields.source_bucket = Some(get_string(child, &field)?),
                "source-key-prefix" => fields.source_key_prefix = Some(get_string(child, &field)?),
                "artifact-bucket" => fields.artifact_bucket = Some(get_string(child, &field)?),
                "artifact-key-prefix" => {
                    fields.artifact_key_prefix = Some(get_string(child, &field)?)
                }
                "no-artifacts" => fields.no_artifacts = Some(get_bool(child, &field)?),
                _ => return Err(ConfigError::invalid(field, "is not a known build field")),
            }
        }

        Ok(fields)
    }

    /// Merge `over` on top of `self`. Fields set in `over` win.
    pub fn layer(&self, over: &BuildFields) -> BuildFields {
        fn pick<T: Clone>(over: &Option<T>, under: &Option<T>) -> Option<T> {
            over.clone().or_else(|| under.clone())
        }

        BuildFields {
            project: pick(&over.project, &self.project),
            image: pick(&over.image, &self.image),
            run: pick(&over.run, &self.run),
            commit_status: pick(&over.commit_status, &self.commit_status),
            depends_on: pick(&over.depends_on, &self.depends_on),
            timeout_minutes: pick(&over.timeout_minutes, &self.timeout_minutes),
            privileged: pick(&over.privileged, &self.privileged),
            stop_if_not_branch_head: pick(
                &over.stop_if_not_branch_head,
                &self.stop_if_not_branch_head,
            ),
            branches: pick(&over.branches, &self.branches),
            env: pick(&over.env, &self.env),
            source_bucket: pick(&over.source_bucket, &self.source_bucket),
            source_key_prefix: pick(&over.source_key_prefix, &self.source_key_prefix),
            artifact_bucket: pick(&over.artifact_bucket, &self.artifact_bucket),
            artifact_key_prefix: pick(&over.artifact_key_prefix, &self.artifact_key_prefix),
            no_artifacts: pick(&over.no_artifacts, &self.no_artifacts),
        }
    }
}

/// One `build` node.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestBuild {
    pub key: String,
    pub fields: BuildFields,
}

/// A parsed, not yet resolved manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: i64,
    pub checks_name: String,
    pub defaults: BuildFields,
    /// Builds in manifest order.
    pub builds: Vec<ManifestBuild>,
}

/// Inputs for resolving a manifest into build specs.
pub struct ResolveContext<'a> {
    /// Default layers, lowest precedence first.
    pub defaults: Vec<&'a BuildFields>,
    /// Allowed job targets. `None` skips the allow-list check.
    pub allowed_projects: Option<&'a [String]>,
    pub variables: &'a VariableContext,
}

/// A manifest whose builds are fully validated and acyclic.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub checks_name: String,
    /// Builds in manifest order.
    pub builds: Vec<BuildSpec>,
    pub graph: DependencyGraph,
}

/// Parse a manifest from KDL text.
pub fn parse_manifest(kdl: &str) -> ConfigResult<Manifest> {
    let doc: KdlDocument = kdl.parse()?;

    let mut version = None;
    let mut checks_name = None;
    let mut defaults = BuildFields::default();
    let mut builds: Vec<ManifestBuild> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "version" => version = Some(get_integer(node, "version")?),
            "checks-name" => checks_name = Some(get_string(node, "checks-name")?),
            "defaults" => defaults = BuildFields::parse(node, "defaults")?,
            "build" => {
                let key = get_string(node, &format!("builds.{}", builds.len()))?;
                validate_build_key(&key)?;
                if builds.iter().any(|b| b.key == key) {
                    return Err(ConfigError::Duplicate(format!("builds.{}", key)));
                }
                let fields = BuildFields::parse(node, &format!("builds.{}", key))?;
                builds.push(ManifestBuild { key, fields });
            }
            other => return Err(ConfigError::invalid(other, "is not a known manifest field")),
        }
    }

    let version = version.ok_or_else(|| ConfigError::MissingField("version".to_string()))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ConfigError::invalid("version", "must be one of: 1"));
    }

    let checks_name = checks_name.unwrap_or_else(|| DEFAULT_CHECKS_NAME.to_string());
    require_min_len(&checks_name, 3, "checks-name")?;

    if builds.is_empty() {
        return Err(ConfigError::MissingField("builds".to_string()));
    }

    Ok(Manifest {
        version,
        checks_name,
        defaults,
        builds,
    })
}

/// Read and parse a manifest file.
pub fn parse_manifest_file(path: &Path) -> ConfigResult<Manifest> {
    let text = std::fs::read_to_string(path)?;
    parse_manifest(&text)
}

/// Best-effort lookup of `checks-name` in a manifest that may not be valid.
pub fn peek_checks_name(kdl: &str) -> Option<String> {
    let doc: KdlDocument = kdl.parse().ok()?;
    let node = doc.nodes().iter().find(|n| n.name().value() == "checks-name")?;
    get_string(node, "checks-name")
        .ok()
        .filter(|name| name.chars().count() >= 3)
}

fn validate_build_key(key: &str) -> ConfigResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ConfigError::invalid(
            format!("builds.{}", key),
            "must only contain letters, digits, '-', '_' or '.'",
        ));
    }
    Ok(())
}

impl Manifest {
    /// Layer defaults, validate every build and check dependencies.
    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> ConfigResult<ResolvedManifest> {
        let mut base = BuildFields::default();
        for layer in &ctx.defaults {
            base = base.layer(layer);
        }
        base = base.layer(&self.defaults);

        let builds = self
            .builds
            .iter()
            .map(|b| finalize_build(&b.key, &base.layer(&b.fields), ctx))
            .collect::<ConfigResult<Vec<_>>>()?;

        let graph = DependencyGraph::build(&builds)?;

        Ok(ResolvedManifest {
            checks_name: self.checks_name.clone(),
            builds,
            graph,
        })
    }
}

fn finalize_build(
    key: &str,
    fields: &BuildFields,
    ctx: &ResolveContext<'_>,
) -> ConfigResult<BuildSpec> {
    let path = |name: &str| format!("builds.{}.{}", key, name);

    let project = required(&fields.project, &path("project"))?;
    if let Some(allowed) = ctx.allowed_projects {
        if !allowed.iter().any(|p| *p == project) {
            return Err(ConfigError::DisallowedJobTarget {
                build: key.to_string(),
                project,
            });
        }
    }

    let image = required(&fields.image, &path("image"))?;

    let commit_status = match &fields.commit_status {
        Some(status) => {
            require_min_len(status, 3, &path("commit-status"))?;
            Some(status.clone())
        }
        None => None,
    };

    let depends_on = fields.depends_on.clone().unwrap_or_default();
    let mut seen = BTreeSet::new();
    for (i, dep) in depends_on.iter().enumerate() {
        let dep_path = format!("{}.{}", path("depends-on"), i);
        if dep.is_empty() {
            return Err(ConfigError::invalid(dep_path, "must have a value"));
        }
        if !seen.insert(dep.as_str()) {
            return Err(ConfigError::Duplicate(dep_path));
        }
    }

    let timeout_minutes = fields.timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES);
    if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&timeout_minutes) {
        return Err(ConfigError::invalid(
            path("timeout-minutes"),
            format!(
                "must be between {} and {}",
                MIN_TIMEOUT_MINUTES, MAX_TIMEOUT_MINUTES
            ),
        ));
    }

    let branches = fields.branches.clone().unwrap_or_default();
    for (i, pattern) in branches.iter().enumerate() {
        let pattern_path = format!("{}.{}", path("branches"), i);
        if pattern.is_empty() {
            return Err(ConfigError::invalid(pattern_path, "must have a value"));
        }
        if BranchPattern::parse(pattern).is_none() {
            return Err(ConfigError::invalid(pattern_path, "is an invalid pattern"));
        }
    }

    let env = fields.env.clone().unwrap_or_default();
    for (name, value) in &env {
        let env_path = format!("{}.{}", path("env"), name);
        if name.to_uppercase().starts_with(RESERVED_ENV_PREFIX) {
            return Err(ConfigError::invalid(
                env_path,
                format!("must not start with {}", RESERVED_ENV_PREFIX),
            ));
        }
        if value.is_empty() {
            return Err(ConfigError::invalid(env_path, "must have a value"));
        }
    }

    let source = StorageLocation {
        bucket: required(&fields.source_bucket, &path("source-bucket"))?,
        key_prefix: key_prefix(&fields.source_key_prefix, &path("source-key-prefix"), ctx)?,
    };

    let artifacts = if fields.no_artifacts.unwrap_or(false) {
        None
    } else {
        match &fields.artifact_bucket {
            Some(bucket) => {
                if bucket.is_empty() {
                    return Err(ConfigError::invalid(path("artifact-bucket"), "must have a value"));
                }
                Some(StorageLocation {
                    bucket: bucket.clone(),
                    key_prefix: key_prefix(
                        &fields.artifact_key_prefix,
                        &path("artifact-key-prefix"),
                        ctx,
                    )?,
                })
            }
            None => None,
        }
    };

    Ok(BuildSpec {
        key: key.to_string(),
        commit_status,
        depends_on,
        branches,
        stop_if_not_branch_head: fields.stop_if_not_branch_head.unwrap_or(false),
        job: JobParams {
            project,
            image,
            commands: fields.run.clone().unwrap_or_default(),
            privileged: fields.privileged.unwrap_or(false),
            timeout_minutes: timeout_minutes as u32,
            env,
            source,
            artifacts,
        },
    })
}

fn required(value: &Option<String>, path: &str) -> ConfigResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        Some(_) => Err(ConfigError::invalid(path, "must have a value")),
        None => Err(ConfigError::MissingField(path.to_string())),
    }
}

fn key_prefix(
    value: &Option<String>,
    path: &str,
    ctx: &ResolveContext<'_>,
) -> ConfigResult<String> {
    let prefix = value.clone().unwrap_or_default();
    if prefix.starts_with('/') {
        return Err(ConfigError::invalid(path, "must not start with \"/\""));
    }
    if let Some(unknown) = unknown_variables(&prefix).first() {
        return Err(ConfigError::invalid(
            path,
            format!("uses unknown variable ${{{}}}", unknown),
        ));
    }
    Ok(ctx.variables.interpolate(&prefix))
}

/// A branch filter: a glob where `*` matches anything, or `/regex/`.
#[derive(Debug, Clone)]
pub struct BranchPattern(Regex);

impl BranchPattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let source = if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            pattern[1..pattern.len() - 1].to_string()
        } else {
            let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
            format!("^{}$", escaped.join(".*"))
        };
        Regex::new(&source).ok().map(BranchPattern)
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.0.is_match(branch)
    }
}

/// Whether a build filtered by `patterns` runs for `branch`. No patterns matches every branch.
pub fn branch_matches(patterns: &[String], branch: &str) -> bool {
    patterns.is_empty()
        || patterns
            .iter()
            .filter_map(|p| BranchPattern::parse(p))
            .any(|p| p.matches(branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    const MANIFEST: &str = r#"
        version 1
        checks-name "Widgets CI"

        defaults {
            project "default"
            source-bucket "sources"
            source-key-prefix "${repo.owner}/${repo.name}/"
            timeout-minutes 10
        }

        build "lint" {
            image "rust:1.85"
            run "cargo fmt --check"
            run "cargo clippy"
        }

        build "test" {
            image "rust:1.85"
            run "cargo test"
            depends-on "lint"
            commit-status "CI/test"
            timeout-minutes 30
            env {
                RUST_BACKTRACE "1"
            }
            artifact-bucket "artifacts"
            artifact-key-prefix "${commit.sha}/"
        }
    "#;

    fn vars() -> VariableContext {
        VariableContext::new("github.com/acme/widgets".parse().unwrap(), "abc123")
    }

    fn resolve(manifest: &Manifest, allowed: &[String]) -> ConfigResult<ResolvedManifest> {
        let variables = vars();
        manifest.resolve(&ResolveContext {
            defaults: vec![],
            allowed_projects: Some(allowed),
            variables: &variables,
        })
    }

    fn allowed() -> Vec<String> {
        vec!["default".to_string()]
    }

    fn minimal(build_body: &str) -> String {
        format!(
            r#"
            version 1
            build "b" {{
                project "default"
                image "alpine"
                source-bucket "sources"
                {}
            }}
            "#,
            build_body
        )
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = parse_manifest(MANIFEST).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.checks_name, "Widgets CI");
        assert_eq!(manifest.builds.len(), 2);
        assert_eq!(manifest.builds[0].key, "lint");
        assert_eq!(
            manifest.builds[0].fields.run.as_deref(),
            Some(&["cargo fmt --check".to_string(), "cargo clippy".to_string()][..])
        );
    }

    #[test]
    fn test_resolve_layers_defaults() {
        let manifest = parse_manifest(MANIFEST).unwrap();
        let resolved = resolve(&manifest, &allowed()).unwrap();

        let lint = &resolved.builds[0];
        assert_eq!(lint.job.timeout_minutes, 10);
        assert_eq!(lint.job.source.key_prefix, "acme/widgets/");
        assert!(lint.job.artifacts.is_none());
        assert!(lint.commit_status.is_none());

        let test = &resolved.builds[1];
        assert_eq!(test.job.timeout_minutes, 30);
        assert_eq!(test.depends_on, vec!["lint".to_string()]);
        assert_eq!(test.commit_status.as_deref(), Some("CI/test"));
        assert_eq!(test.job.env.get("RUST_BACKTRACE").map(String::as_str), Some("1"));
        let artifacts = test.job.artifacts.as_ref().unwrap();
        assert_eq!(artifacts.bucket, "artifacts");
        assert_eq!(artifacts.key_prefix, "abc123/");
    }

    #[test]
    fn test_global_and_repo_layers() {
        let global = BuildFields {
            image: Some("global-image".to_string()),
            timeout_minutes: Some(60),
            ..Default::default()
        };
        let repo = BuildFields {
            timeout_minutes: Some(90),
            ..Default::default()
        };
        let manifest = parse_manifest(
            r#"
            version 1
            build "b" {
                project "default"
                source-bucket "sources"
            }
            "#,
        )
        .unwrap();

        let variables = vars();
        let allowed = allowed();
        let resolved = manifest
            .resolve(&ResolveContext {
                defaults: vec![&global, &repo],
                allowed_projects: Some(&allowed),
                variables: &variables,
            })
            .unwrap();

        assert_eq!(resolved.builds[0].job.image, "global-image");
        assert_eq!(resolved.builds[0].job.timeout_minutes, 90);
        assert_eq!(resolved.checks_name, DEFAULT_CHECKS_NAME);
    }

    #[test]
    fn test_version_required() {
        let err = parse_manifest(r#"build "b" { image "x" }"#).unwrap_err();
        assert_eq!(err.to_string(), "version is required");

        let err = parse_manifest("version 2\nbuild \"b\"").unwrap_err();
        assert_eq!(err.to_string(), "version must be one of: 1");
    }

    #[test]
    fn test_builds_required() {
        let err = parse_manifest("version 1").unwrap_err();
        assert_eq!(err.to_string(), "builds is required");
    }

    #[test]
    fn test_duplicate_build() {
        let err = parse_manifest("version 1\nbuild \"a\"\nbuild \"a\"").unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(ref p) if p == "builds.a"));
    }

    #[test]
    fn test_unknown_field_has_path() {
        let err = parse_manifest(&minimal("colour \"blue\"")).unwrap_err();
        assert_eq!(err.to_string(), "builds.b.colour is not a known build field");
    }

    #[test]
    fn test_timeout_range() {
        let manifest = parse_manifest(&minimal("timeout-minutes 481")).unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "builds.b.timeout-minutes must be between 5 and 480"
        );

        let manifest = parse_manifest(&minimal("timeout-minutes 480")).unwrap();
        assert!(resolve(&manifest, &allowed()).is_ok());
    }

    #[test]
    fn test_reserved_env_prefix() {
        let manifest = parse_manifest(&minimal("env { CBUILD_COMMIT_SHA \"x\" }")).unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "builds.b.env.CBUILD_COMMIT_SHA must not start with CBUILD_"
        );
    }

    #[test]
    fn test_key_prefix_rules() {
        let manifest = parse_manifest(&minimal("source-key-prefix \"/abs/\"")).unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "builds.b.source-key-prefix must not start with \"/\""
        );

        let manifest = parse_manifest(&minimal("source-key-prefix \"${git.branch}/\"")).unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert!(err.to_string().contains("unknown variable ${git.branch}"));
    }

    #[test]
    fn test_disallowed_project() {
        let manifest = parse_manifest(&minimal("")).unwrap();
        let err = resolve(&manifest, &["other".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::DisallowedJobTarget { .. }));

        let variables = vars();
        let unchecked = manifest.resolve(&ResolveContext {
            defaults: vec![],
            allowed_projects: None,
            variables: &variables,
        });
        assert!(unchecked.is_ok());
    }

    #[test]
    fn test_invalid_branch_pattern() {
        let manifest = parse_manifest(&minimal(r#"branches "main" "/+/""#)).unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert_eq!(err.to_string(), "builds.b.branches.1 is an invalid pattern");
    }

    #[test]
    fn test_no_artifacts_wins() {
        let manifest =
            parse_manifest(&minimal("artifact-bucket \"artifacts\"\nno-artifacts #true")).unwrap();
        let resolved = resolve(&manifest, &allowed()).unwrap();
        assert!(resolved.builds[0].job.artifacts.is_none());
    }

    #[test]
    fn test_circular_manifest() {
        let manifest = parse_manifest(
            r#"
            version 1
            defaults {
                project "default"
                image "alpine"
                source-bucket "sources"
            }
            build "A" { depends-on "B"; }
            build "B" { depends-on "A"; }
            "#,
        )
        .unwrap();
        let err = resolve(&manifest, &allowed()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_branch_patterns() {
        assert!(branch_matches(&[], "anything"));
        let patterns = vec!["main".to_string(), "release/*".to_string()];
        assert!(branch_matches(&patterns, "main"));
        assert!(branch_matches(&patterns, "release/1.2"));
        assert!(!branch_matches(&patterns, "feature/x"));
        assert!(!branch_matches(&patterns, "mainline"));

        let regex = vec!["/^feat-\\d+$/".to_string()];
        assert!(branch_matches(&regex, "feat-12"));
        assert!(!branch_matches(&regex, "feat-x"));
    }

    #[test]
    fn test_peek_checks_name() {
        assert_eq!(
            peek_checks_name("checks-name \"Widgets CI\"\nversion 9"),
            Some("Widgets CI".to_string())
        );
        assert_eq!(peek_checks_name("not { valid kdl"), None);
    }
}
