//! Error types for staging operations.

use std::io;
use thiserror::Error;

/// Result type for staging operations.
pub type StagingResult<T> = Result<T, StagingError>;

/// Errors that can occur while staging batch payloads.
#[derive(Debug, Error)]
pub enum StagingError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No resource exists for the key.
    #[error("staged resource not found: {0}")]
    NotFound(String),

    /// The resource is DONE and can no longer be written.
    #[error("staged resource {0} is read-only")]
    ReadOnly(String),

    /// The resource was deleted while still referenced.
    #[error("staged resource {0} was deleted")]
    Deleted(String),

    /// Content does not match the checksum recorded at completion.
    #[error("checksum mismatch for {key}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Resource key.
        key: String,
        /// Checksum recorded when the resource was finished.
        expected: String,
        /// Checksum of the current content.
        actual: String,
    },

    /// The resource or its metadata is unreadable.
    #[error("staged resource corrupt: {0}")]
    Corrupt(String),
}

impl StagingError {
    /// Whether the error means the staged artifact cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StagingError::ChecksumMismatch { .. }
                | StagingError::Corrupt(_)
                | StagingError::Deleted(_)
                | StagingError::NotFound(_)
        )
    }
}
