//! Database-backed job queue with at-least-once delivery.
//!
//! ## Design
//!
//! - Jobs are rows; a serialized handler plus scheduling and lease columns
//! - Workers lease rows by writing their identity into `locked_by`
//! - Each attempt ends in exactly one resolution: delete, count-and-release,
//!   reschedule, or permanent failure once the attempt budget is spent
//! - Leases never expire; a restarted worker with the same identity reclaims
//!   its own stale rows
//!
//! ## Components
//!
//! - `JobStore`: conditional row updates (in-memory or Postgres)
//! - `Lease`: the acquire / release / finish protocol
//! - `JobRun`: runs one leased job and resolves it from the handler outcome
//! - `Worker`: the polling loop
//! - `JobQueue`: enqueue and status for producers

pub mod executor;
pub mod lease;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod worker;

pub use executor::{JobResolution, JobRun};
pub use lease::Lease;
pub use postgres::PostgresJobStore;
pub use queue::{EnqueueError, JobQueue};
pub use store::{ClaimQuery, FailureRecord, InMemoryJobStore, JobStore, JobStoreError};
pub use worker::{Worker, WorkerError, WorkerHandle, WorkerReport};
