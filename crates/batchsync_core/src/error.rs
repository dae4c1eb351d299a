//! Error types for batchsync core.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Classification of a failure, fixed where the failure is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A captured value is larger than the capture path allows.
    Truncation,
    /// A staged payload is missing, unreadable or fails its checksum.
    StageCorruption,
    /// A lock could not be obtained in time.
    LockTimeout,
    /// The staging medium is (nearly) full.
    DiskFull,
    /// Input or configuration was rejected.
    Validation,
    /// An operator interrupted the operation.
    Interrupted,
    /// Anything else.
    Unknown,
}

/// Errors that can occur in batchsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Staging store error.
    #[error("staging error: {0}")]
    Staging(#[from] batchsync_storage::StagingError),

    /// Wire format error.
    #[error("protocol error: {0}")]
    Protocol(#[from] batchsync_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A captured value exceeds the capture limit.
    #[error("value of {length} bytes in {table} (data id {data_id}) exceeds capture limit of {limit}")]
    Truncation {
        /// Table of the record.
        table: String,
        /// Record id.
        data_id: u64,
        /// Length of the largest payload.
        length: usize,
        /// Configured capture limit.
        limit: usize,
    },

    /// A request or configuration was rejected.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// A row that must exist does not.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing row.
        what: String,
    },

    /// A row with the same key already exists.
    #[error("{what} already exists")]
    DuplicateKey {
        /// Description of the duplicate row.
        what: String,
    },

    /// Another process holds the database directory.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Snapshot file is invalid.
    #[error("invalid snapshot: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// The operation was interrupted.
    #[error("interrupted: {message}")]
    Interrupted {
        /// What was interrupted.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::DuplicateKey { what: what.into() }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an interrupted error.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Staging(e) if e.is_corruption() => ErrorKind::StageCorruption,
            CoreError::Protocol(_) => ErrorKind::StageCorruption,
            CoreError::Truncation { .. } => ErrorKind::Truncation,
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::Interrupted { .. } => ErrorKind::Interrupted,
            CoreError::DatabaseLocked => ErrorKind::LockTimeout,
            _ => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_storage::StagingError;

    #[test]
    fn test_kind_is_structural() {
        let truncation = CoreError::Truncation {
            table: "docs".into(),
            data_id: 3,
            length: 5000,
            limit: 4000,
        };
        assert_eq!(truncation.kind(), ErrorKind::Truncation);
        assert_eq!(
            CoreError::from(StagingError::Corrupt("bad".into())).kind(),
            ErrorKind::StageCorruption
        );
        assert_eq!(
            CoreError::from(StagingError::Io(io::Error::new(io::ErrorKind::Other, "x"))).kind(),
            ErrorKind::Unknown
        );
        // a message mentioning truncation does not change the kind
        assert_eq!(
            CoreError::validation("string data, right truncation").kind(),
            ErrorKind::Validation
        );
    }
}
