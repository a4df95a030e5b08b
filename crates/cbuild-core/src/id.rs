//! Identifiers for traces, repositories, executions and locks.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Highest execution number allowed for a single commit.
pub const MAX_EXECUTION_NUMBER: u32 = 9999;

/// Trace id of one execution. Also identifies the owner of the commit lock.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct TraceId(Uuid);

impl TraceId {
    /// Create a new unique TraceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a TraceId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TraceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TraceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Repository identifier of the form `host/owner/repo`, always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{host}/{owner}/{name}")]
pub struct RepoId {
    host: String,
    owner: String,
    name: String,
}

impl RepoId {
    pub fn new(host: &str, owner: &str, name: &str) -> Result<Self> {
        format!("{}/{}/{}", host, owner, name).parse()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        let parts: Vec<&str> = lower.split('/').collect();
        let valid = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && !p.chars().any(char::is_whitespace));

        if !valid {
            return Err(Error::InvalidInput(format!("invalid repo id: {}", s)));
        }

        Ok(Self {
            host: parts[0].to_string(),
            owner: parts[1].to_string(),
            name: parts[2].to_string(),
        })
    }
}

impl TryFrom<String> for RepoId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RepoId> for String {
    fn from(id: RepoId) -> Self {
        id.to_string()
    }
}

/// Execution identifier: `commit/NNNN`, where `NNNN` is a zero-padded
/// counter scoped to the repository and commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{commit}/{number:04}")]
pub struct ExecutionId {
    commit: String,
    number: u32,
}

impl ExecutionId {
    pub fn new(commit: &str, number: u32) -> Result<Self> {
        if commit.is_empty() || commit.contains('/') {
            return Err(Error::InvalidInput(format!("invalid commit: {:?}", commit)));
        }
        if number == 0 || number > MAX_EXECUTION_NUMBER {
            return Err(Error::InvalidInput(format!(
                "execution number {} out of range 1..={}",
                number, MAX_EXECUTION_NUMBER
            )));
        }
        Ok(Self {
            commit: commit.to_lowercase(),
            number,
        })
    }

    /// The first execution for a commit.
    pub fn first(commit: &str) -> Result<Self> {
        Self::new(commit, 1)
    }

    /// The execution following this one. Fails past `MAX_EXECUTION_NUMBER`.
    pub fn next(&self) -> Result<Self> {
        Self::new(&self.commit, self.number + 1)
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// The zero-padded execution number, e.g. `0007`.
    pub fn padded_number(&self) -> String {
        format!("{:04}", self.number)
    }
}

impl FromStr for ExecutionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (commit, number) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("invalid execution id: {}", s)))?;

        if number.len() != 4 || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!("invalid execution id: {}", s)));
        }

        let number = number
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid execution id: {}", s)))?;
        Self::new(commit, number)
    }
}

impl TryFrom<String> for ExecutionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExecutionId> for String {
    fn from(id: ExecutionId) -> Self {
        id.to_string()
    }
}

/// Repository-qualified execution id, `host/owner/repo/commit/NNNN`.
/// Used as the external id of the aggregate report.
pub fn long_execution_id(repo: &RepoId, execution: &ExecutionId) -> String {
    format!("{}/{}", repo, execution)
}

/// Parse a repository-qualified execution id.
pub fn parse_long_execution_id(s: &str) -> Result<(RepoId, ExecutionId)> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 5 {
        return Err(Error::InvalidInput(format!("invalid execution reference: {}", s)));
    }
    let repo = RepoId::new(parts[0], parts[1], parts[2])?;
    let execution = format!("{}/{}", parts[3], parts[4]).parse()?;
    Ok((repo, execution))
}

/// Key of the mutual-exclusion record for one (repository, commit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct LockId(String);

impl LockId {
    pub fn for_commit(repo: &RepoId, commit: &str) -> Self {
        Self(format!("{}/{}", repo, commit).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
