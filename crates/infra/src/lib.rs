//! Infrastructure layer: job storage, the lease protocol, execution and workers.

pub mod config;
pub mod jobs;

pub use config::{CandidateOrder, ConfigError, Settings, WorkerConfig};
