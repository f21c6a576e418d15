//! Error types for the state blob.

use thiserror::Error;

use consres_select::SelectError;

/// Result type alias for persistence operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while saving or loading the state blob.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("state blob truncated while reading {0}")]
    Truncated(&'static str),

    #[error("value out of range for the blob format: {0}")]
    Overflow(String),

    #[error("invalid field in state blob: {0}")]
    Invalid(String),

    #[error(transparent)]
    Select(#[from] SelectError),
}
