//! CLI command implementations.

pub mod demo;
pub mod inspect;
pub mod staging;

use thiserror::Error;

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Ledger error.
    #[error(transparent)]
    Core(#[from] batchsync_core::CoreError),

    /// Staging area error.
    #[error(transparent)]
    Staging(#[from] batchsync_storage::StagingError),

    /// Engine error.
    #[error(transparent)]
    Sync(#[from] batchsync_engine::SyncError),

    /// JSON output failed.
    #[error("json output: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad arguments or missing input.
    #[error("{0}")]
    Usage(String),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format of reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Maps a `--json` flag.
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Format::Json
        } else {
            Format::Text
        }
    }
}
