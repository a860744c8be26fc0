//! Muxer error types.

use thiserror::Error;
use vcr_common::SourceError;

/// Errors that can occur while recording an MP4 file.
#[derive(Error, Debug)]
pub enum MuxError {
    /// I/O error during file write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid muxer or track configuration.
    #[error("Invalid muxer config: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current writer state.
    #[error("Invalid writer state: {0}")]
    InvalidState(String),

    /// Codec not supported by the container writer.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Malformed input from a source (bad codec config, broken NAL
    /// framing, empty track, offset overflow).
    #[error("Malformed track data: {0}")]
    Malformed(String),

    /// Audio/video clock drift exceeded the correctable tolerance.
    #[error("Clock drift out of tolerance: {0}")]
    DriftOutOfTolerance(String),

    /// Error propagated from a sample source.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;
