//! `vcr-common`: shared types and errors for the vcr recording engine.
//!
//! This crate is the foundation the recorder crates depend on. It defines
//! the seam between capture/encode sources and the container writer:
//!
//! - **Codecs**: `VideoCodec`, `AudioCodec` (with MIME mapping)
//! - **Types**: `Resolution`, `Rotation`, `TrackKind`
//! - **Samples**: `Sample`, `MediaFormat`, `SourceFormat` (data flow types)
//! - **Errors**: `SourceError` (thiserror-based)

pub mod codec;
pub mod error;
pub mod sample;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{AudioCodec, VideoCodec};
pub use error::SourceError;
pub use sample::{MediaFormat, Sample, SourceFormat};
pub use types::{Resolution, Rotation, TrackKind};
