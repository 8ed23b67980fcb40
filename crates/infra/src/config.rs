//! Configuration loading and representation.
//!
//! Worker behavior is described by [`WorkerConfig`]; the process-level
//! [`Settings`] add the connection string, table name and worker prefix and
//! are read from `TABLEJOB_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tablejob_core::{DEFAULT_QUEUE, DomainError, JobsTable};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_WORKER_PREFIX: &str = "tablejob";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Which end of the candidate list a worker reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Most recently created first.
    #[default]
    NewestFirst,
    OldestFirst,
}

impl CandidateOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::NewestFirst => "DESC",
            Self::OldestFirst => "ASC",
        }
    }
}

impl FromStr for CandidateOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest" | "newest_first" | "desc" => Ok(Self::NewestFirst),
            "oldest" | "oldest_first" | "asc" => Ok(Self::OldestFirst),
            _ => Err(ConfigError::invalid(
                "TABLEJOB_ORDER",
                s,
                "expected `newest` or `oldest`",
            )),
        }
    }
}

/// Polling worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue the worker polls.
    pub queue: String,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
    /// Attempt budget; a job is failed once `attempts` reaches it.
    pub max_attempts: u32,
    /// Polling iterations before the worker stops (0 = unlimited).
    pub count: u64,
    /// Candidates fetched per poll.
    pub batch_size: usize,
    pub order: CandidateOrder,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            count: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            order: CandidateOrder::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Clamped to at least one attempt.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    /// Whether the worker runs until told to stop.
    pub fn is_unbounded(&self) -> bool {
        self.count == 0
    }
}

/// Everything a worker process needs, usually read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub table: JobsTable,
    pub worker_prefix: String,
    pub worker: WorkerConfig,
}

impl Settings {
    /// Read settings from process environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_URL` | required |
    /// | `TABLEJOB_TABLE` | `jobs` |
    /// | `TABLEJOB_QUEUE` | `default` |
    /// | `TABLEJOB_SLEEP_SECS` | `5` |
    /// | `TABLEJOB_MAX_ATTEMPTS` | `5` |
    /// | `TABLEJOB_COUNT` | `0` (unlimited) |
    /// | `TABLEJOB_BATCH_SIZE` | `10` |
    /// | `TABLEJOB_WORKER_PREFIX` | `tablejob` |
    /// | `TABLEJOB_ORDER` | `newest` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let table = match get("TABLEJOB_TABLE") {
            Some(raw) => JobsTable::new(raw.trim())
                .map_err(|e: DomainError| ConfigError::invalid("TABLEJOB_TABLE", &raw, e))?,
            None => JobsTable::default(),
        };

        let mut worker = WorkerConfig::default();
        if let Some(queue) = get("TABLEJOB_QUEUE") {
            worker.queue = queue.trim().to_string();
        }
        if let Some(raw) = get("TABLEJOB_SLEEP_SECS") {
            let secs: u64 = parse("TABLEJOB_SLEEP_SECS", &raw)?;
            worker.poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = get("TABLEJOB_MAX_ATTEMPTS") {
            let max: u32 = parse("TABLEJOB_MAX_ATTEMPTS", &raw)?;
            if max == 0 {
                return Err(ConfigError::invalid(
                    "TABLEJOB_MAX_ATTEMPTS",
                    &raw,
                    "must be at least 1",
                ));
            }
            worker.max_attempts = max;
        }
        if let Some(raw) = get("TABLEJOB_COUNT") {
            worker.count = parse("TABLEJOB_COUNT", &raw)?;
        }
        if let Some(raw) = get("TABLEJOB_BATCH_SIZE") {
            let size: usize = parse("TABLEJOB_BATCH_SIZE", &raw)?;
            worker = worker.with_batch_size(size);
        }
        if let Some(raw) = get("TABLEJOB_ORDER") {
            worker.order = raw.parse()?;
        }

        let worker_prefix = get("TABLEJOB_WORKER_PREFIX")
            .map(|p| p.trim().to_string())
            .unwrap_or_else(|| DEFAULT_WORKER_PREFIX.to_string());

        Ok(Self {
            database_url,
            table,
            worker_prefix,
            worker,
        })
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, raw, e))
}
