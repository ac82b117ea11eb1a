//! Common error types for the groundsync engine.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field is missing or a value is out of range.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The mutation type tag is not one the applicator understands.
    #[error("Unsupported mutation type: {0}")]
    UnsupportedMutationType(String),

    /// Network transport failed or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote record could not be decoded into a domain entity.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The enclosing job was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether the error is worth retrying with backoff.
    ///
    /// Only transport and local I/O failures qualify; validation and decode
    /// errors would fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("timeout".to_string()).is_transient());
        assert!(Error::Io(std::io::Error::other("disk")).is_transient());
        assert!(!Error::Decode("Missing formId".to_string()).is_transient());
        assert!(!Error::UnsupportedMutationType("MOVE".to_string()).is_transient());
        assert!(!Error::Storage("constraint".to_string()).is_transient());
    }
}
