//! `vcr-mux`: MP4 recording muxer for the video capture engine.
//!
//! This crate turns live encoded streams into a playable MP4 file
//! (ISO Base Media File Format / ISO 14496-12), the way a camcorder
//! does: media data lands on disk the moment it is pulled from the
//! encoders, and the metadata is reconciled when recording stops.
//!
//! # Architecture
//!
//! - **No FFmpeg dependency**: pure Rust MP4 box writing
//! - **Pull model**: every [`SampleSource`] gets its own puller thread
//! - **Chunked interleaving**: a writer thread merges per-track chunks
//!   into mdat in timestamp order
//! - **Moov-ahead-of-mdat**: a free-space reserve after ftyp usually
//!   lets the finished file stream without rewriting
//! - **Codec support**: H.264 (avcC), MPEG-4 Visual (esds), H.263
//!   (d263) for video; AAC (esds), AMR-NB/WB (damr) for audio
//!
//! # Usage
//!
//! ```ignore
//! use vcr_mux::{Mp4Muxer, MuxerConfig, MuxerEvent, TrackOptions};
//!
//! let mut muxer = Mp4Muxer::new(MuxerConfig::new("output.mp4"))?;
//! muxer.add_source(camera_source, TrackOptions::default())?;
//! muxer.add_source(mic_source, TrackOptions::default())?;
//!
//! let events = muxer.events();
//! muxer.start()?;
//!
//! // ... samples flow on background threads ...
//! while let Ok(event) = events.recv() {
//!     if event == MuxerEvent::MaxFileSizeReached {
//!         break;
//!     }
//! }
//!
//! // Stop joins the threads and writes the moov box
//! muxer.stop()?;
//! ```

pub mod atoms;
pub mod error;
mod interleave;
pub mod mp4;
pub mod muxer;
pub mod nal;
pub mod source;
mod track;

// Re-export primary API types
pub use error::{MuxError, MuxResult};
pub use mp4::GeoData;
pub use muxer::{
    DriftConfig, MoovReserveConfig, Mp4Muxer, MuxerConfig, MuxerEvent, TrackOptions,
};
pub use source::SampleSource;
