//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding the batch wire format.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A line did not start with a known keyword.
    #[error("unknown keyword '{keyword}' on line {line}")]
    UnknownKeyword {
        /// The keyword found.
        keyword: String,
        /// 1-based line number.
        line: usize,
    },

    /// A line had a malformed payload.
    #[error("malformed line {line}: {message}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// An unknown status or event code.
    #[error("invalid code '{0}'")]
    InvalidCode(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a malformed-line error.
    pub fn malformed(line: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            message: message.into(),
        }
    }
}
