//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Deterministic validation failures only. Storage and runtime failures live
/// in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure, illegal characters).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
