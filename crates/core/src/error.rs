//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Only malformed identifiers live here. Payload validation is reported by
/// the queue layer; storage and runtime failures belong to infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
