//! Log pipeline error types

use thiserror::Error;

/// Errors surfaced by the log fan-out
#[derive(Debug, Error)]
pub enum LogError {
    /// Lines are the unit of the pipeline; embedded newlines would corrupt
    /// the on-disk framing.
    #[error("Log line cannot contain a newline")]
    LineContainsNewline,

    /// The configured log directory failed the startup write probe
    #[error("Log directory '{dir}' is not writable: {source}")]
    Unwritable {
        dir: String,
        source: std::io::Error,
    },

    /// Reading the persisted log back failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for log operations
pub type Result<T, E = LogError> = std::result::Result<T, E>;
