//! `tablejob-core` — queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or runtime concerns).

pub mod error;
pub mod handler;
pub mod id;
pub mod job;
pub mod outcome;
pub mod payload;

pub use error::DomainError;
pub use handler::{JobHandler, TypedJob};
pub use id::{DEFAULT_JOBS_TABLE, DEFAULT_QUEUE, JobId, JobsTable, WorkerId};
pub use job::{Job, NewJob, QueueStatus};
pub use outcome::{DEFAULT_RETRY_DELAY, HandlerOutcome, MAX_RETRY_DELAY, RetryLater};
pub use payload::{HandlerRegistry, PayloadError};
