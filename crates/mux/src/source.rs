//! Sample source abstraction.
//!
//! A [`SampleSource`] is the muxer's view of an encoder or capture
//! pipeline: a pull-based stream of encoded samples for one track.
//! Each added source gets its own puller thread, so implementations
//! must be [`Send`].

use vcr_common::{Sample, SourceError, SourceFormat};

/// Pull-based supplier of encoded samples for a single track.
pub trait SampleSource: Send {
    /// Static description of the stream: media kind, codec, and
    /// optional out-of-band codec config.
    fn format(&self) -> SourceFormat;

    /// Called once from [`Mp4Muxer::start`](crate::muxer::Mp4Muxer::start)
    /// before any `read`. A failure here aborts the whole start.
    fn start(&mut self) -> Result<(), SourceError>;

    /// Fetch the next encoded sample in decode order.
    ///
    /// Returns `Ok(None)` at end of stream. `read` may block while
    /// waiting for the encoder, but must keep returning in bounded
    /// time: the muxer's stop request is checked between reads, never
    /// during one.
    fn read(&mut self) -> Result<Option<Sample>, SourceError>;

    /// Called from the puller thread after the last `read`, whether the
    /// track finished cleanly or not.
    fn stop(&mut self) -> Result<(), SourceError>;
}
