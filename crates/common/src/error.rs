//! Error types for sample sources (thiserror-based).

use thiserror::Error;

/// Errors reported by a sample source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not started")]
    NotStarted,

    #[error("source read failed: {0}")]
    ReadFailed(String),

    #[error("source format unavailable: {0}")]
    FormatUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
