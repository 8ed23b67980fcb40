//! Tracing and logging setup shared by tablejob processes.

pub use crate::tracing::LogFormat;

/// Initialize process-wide logging with the format from `TABLEJOB_LOG_FORMAT`
/// (`json` by default, `pretty` for local runs).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
