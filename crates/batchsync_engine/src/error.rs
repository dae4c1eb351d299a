//! Error types for the sync engine.

use batchsync_core::{CoreError, ErrorKind};
use batchsync_protocol::ProtocolError;
use batchsync_storage::StagingError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// `sql_code` recorded on a batch whose staged payload was found corrupt.
///
/// A second corruption of a batch carrying this code moves it to ER.
pub const STAGE_ERROR_CODE: i32 = -5;

/// `sql_code` recorded for generic extraction failures.
pub const GENERIC_ERROR_CODE: i32 = -1;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Ledger, change log or configuration error.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// Staging store error.
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),

    /// Wire format error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A staged payload is missing or unreadable.
    #[error("staged data for batch {batch_id} is unusable: {message}")]
    StageCorruption {
        /// Batch whose payload is bad.
        batch_id: u64,
        /// What was wrong.
        message: String,
    },

    /// Staging medium is too full to extract.
    #[error("staging space low: {available} of {total} bytes free, extraction disabled")]
    DiskFull {
        /// Free bytes.
        available: u64,
        /// Total bytes.
        total: u64,
    },

    /// A lock could not be taken in time.
    #[error("timed out waiting for lock {key}")]
    LockTimeout {
        /// Lock key.
        key: String,
    },

    /// An operator interrupted the work.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Request or configuration rejected.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a stage corruption error.
    pub fn stage_corruption(batch_id: u64, message: impl Into<String>) -> Self {
        Self::StageCorruption {
            batch_id,
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Database(e) => e.kind(),
            SyncError::Staging(e) if e.is_corruption() => ErrorKind::StageCorruption,
            SyncError::Protocol(_) | SyncError::StageCorruption { .. } => {
                ErrorKind::StageCorruption
            }
            SyncError::DiskFull { .. } => ErrorKind::DiskFull,
            SyncError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SyncError::Interrupted(_) => ErrorKind::Interrupted,
            SyncError::Validation(_) | SyncError::Config(_) => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            _ => matches!(self.kind(), ErrorKind::LockTimeout | ErrorKind::Truncation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("closed").is_retryable());
        assert!(SyncError::LockTimeout { key: "1".into() }.is_retryable());
        assert!(SyncError::from(CoreError::Truncation {
            table: "docs".into(),
            data_id: 1,
            length: 10,
            limit: 5,
        })
        .is_retryable());
        assert!(!SyncError::Interrupted("stop".into()).is_retryable());
    }

    #[test]
    fn kinds_follow_the_source() {
        assert_eq!(
            SyncError::from(StagingError::NotFound("x".into())).kind(),
            ErrorKind::StageCorruption
        );
        assert_eq!(
            SyncError::DiskFull {
                available: 1,
                total: 100
            }
            .kind(),
            ErrorKind::DiskFull
        );
        assert_eq!(
            SyncError::from(CoreError::validation("bad")).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SyncError::transport_fatal("x").kind(),
            ErrorKind::Unknown
        );
    }
}
