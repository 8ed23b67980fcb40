//! The job record and the values derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::{DEFAULT_QUEUE, JobId, WorkerId};

/// One row of the jobs relation.
///
/// The lease fields (`locked_at`, `locked_by`) are always set or cleared
/// together. `failed_at` is set once, never cleared, and only together with
/// `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// Serialized handler, `<type-identifier>:<body>`.
    pub handler: String,
    pub queue: String,
    /// Completed non-success attempts.
    pub attempts: u32,
    /// Earliest eligible execution time (`None` = immediately).
    pub run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether `worker` may lease this row at `now` given the attempt budget.
    pub fn is_claimable_by(&self, worker: &WorkerId, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.failed_at.is_none()
            && self.is_lockable_by(worker)
            && self.run_at.is_none_or(|at| at <= now)
            && self.attempts < max_attempts
    }

    /// The lease admission check: not failed, and unlocked or already ours.
    pub fn is_lockable_by(&self, worker: &WorkerId) -> bool {
        self.failed_at.is_none()
            && (self.locked_at.is_none() || self.locked_by.as_ref() == Some(worker))
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub handler: String,
    pub queue: String,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// A job on the default queue, eligible immediately.
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            queue: DEFAULT_QUEUE.to_string(),
            run_at: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// Aggregate counts for one queue.
///
/// `outstanding = total - locked - failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total: u64,
    pub failed: u64,
    pub locked: u64,
    pub outstanding: u64,
}

impl QueueStatus {
    pub fn from_counts(total: u64, failed: u64, locked: u64) -> Self {
        Self {
            total,
            failed,
            locked,
            outstanding: total.saturating_sub(locked).saturating_sub(failed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}
