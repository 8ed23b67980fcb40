//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Name of the queue a job belongs to when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Name of the jobs relation when none is configured.
pub const DEFAULT_JOBS_TABLE: &str = "jobs";

/// Host name used when the local host cannot be resolved.
pub const UNKNOWN_HOST: &str = "Unknown";

/// Identifier of a job row (assigned by the store on insert, immutable).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = i64::from_str(s.trim())
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
        Ok(Self(raw))
    }
}

/// Identity of a worker holding leases: `<prefix>@<host>`.
///
/// Not unique across restarts. A new process started with the same prefix on
/// the same host can re-claim rows that are still locked under this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Build an identity from a caller-supplied prefix and an explicit host.
    pub fn new(prefix: &str, host: &str) -> Self {
        Self(format!("{prefix}@{host}"))
    }

    /// Build an identity for the local host.
    pub fn for_local_host(prefix: &str) -> Self {
        Self::new(prefix, &local_host_name())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((prefix, host)) if !prefix.is_empty() && !host.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(DomainError::invalid_id(format!(
                "WorkerId: expected <prefix>@<host>, got {s:?}"
            ))),
        }
    }
}

/// Resolve the local host name: `HOSTNAME`, then `/etc/hostname`, then
/// [`UNKNOWN_HOST`].
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

/// Validated name of the jobs relation.
///
/// The name is spliced into SQL text, so only `[A-Za-z_][A-Za-z0-9_]*`
/// (optionally schema-qualified with a single `.`) is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobsTable(String);

impl JobsTable {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.split('.').count() <= 2
            && name.split('.').all(is_plain_identifier);
        if !valid {
            return Err(DomainError::invalid_id(format!("JobsTable: {name:?}")));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobsTable {
    fn default() -> Self {
        Self(DEFAULT_JOBS_TABLE.to_string())
    }
}

impl core::fmt::Display for JobsTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_joins_prefix_and_host() {
        let id = WorkerId::new("mailer", "box-1");
        assert_eq!(id.as_str(), "mailer@box-1");
        assert_eq!(id.to_string(), "mailer@box-1");
    }

    #[test]
    fn worker_id_parse_requires_both_parts() {
        assert!("mailer@box-1".parse::<WorkerId>().is_ok());
        assert!("mailer".parse::<WorkerId>().is_err());
        assert!("@box-1".parse::<WorkerId>().is_err());
        assert!("mailer@".parse::<WorkerId>().is_err());
    }

    #[test]
    fn local_worker_id_has_a_host_part() {
        let id = WorkerId::for_local_host("w");
        let (prefix, host) = id.as_str().split_once('@').unwrap();
        assert_eq!(prefix, "w");
        assert!(!host.is_empty());
    }

    #[test]
    fn job_id_parses_and_displays() {
        let id: JobId = " 42 ".parse().unwrap();
        assert_eq!(id, JobId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!(matches!("x".parse::<JobId>(), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn jobs_table_rejects_injection() {
        assert_eq!(JobsTable::default().as_str(), "jobs");
        assert!(JobsTable::new("my_jobs").is_ok());
        assert!(JobsTable::new("queue.jobs").is_ok());
        assert!(JobsTable::new("").is_err());
        assert!(JobsTable::new("1jobs").is_err());
        assert!(JobsTable::new("jobs; DROP TABLE x").is_err());
        assert!(JobsTable::new("a.b.c").is_err());
        assert!(JobsTable::new("a..b").is_err());
    }
}
