//! Common error types for CardStack.

use thiserror::Error;

/// Top-level error type for CardStack operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure (timeout, connection refused). Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote store returned a server-side failure (5xx-equivalent). Retryable.
    #[error("Server error: {0}")]
    Server(String),

    /// Authorization denied for the current user. Not retryable.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// No session or expired session. Requires re-authentication upstream.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Local storage failure. Retryable.
    #[error("Database error: {0}")]
    Database(String),

    /// Local storage is out of space. Fatal for the affected operation.
    #[error("Disk full: {0}")]
    DiskFull(String),

    /// Malformed record. Surfaced immediately, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conflict resolution strategy failed to produce a record.
    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the failed operation may be retried with backoff.
    ///
    /// Transient transport and storage failures are retryable; auth,
    /// permission and validation failures are terminal, as is a full disk.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Server(_) | Error::Database(_) | Error::Io(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
