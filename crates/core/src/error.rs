//! Core error model.

use thiserror::Error;

/// Result type used by the pure building blocks.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised by the pure building blocks before any IO happens.
///
/// Infrastructure faults (broker, store) have their own error types in the
/// crates that talk to those systems.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A JSON value was expected to be an object.
    #[error("not a document: {0}")]
    NotADocument(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
