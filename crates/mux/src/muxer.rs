//! High-level MP4 recording muxer.
//!
//! Samples are pulled from registered sources on dedicated threads,
//! interleaved into mdat chunks, and described by a moov box written
//! when recording stops. A free-space reserve after ftyp lets the moov
//! land ahead of the media data, so finished files stream without a
//! second pass.
//!
//! Usage:
//! ```ignore
//! let mut muxer = Mp4Muxer::new(MuxerConfig::new("output.mp4"))?;
//! muxer.add_source(video_source, TrackOptions::default())?;
//! muxer.add_source(audio_source, TrackOptions::default())?;
//!
//! muxer.start()?;
//! // ... sources deliver samples on their own threads ...
//! muxer.stop()?;
//! ```

use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use vcr_common::{AudioCodec, MediaFormat, Rotation, TrackKind, VideoCodec};

use crate::atoms::{mp4_creation_time, BoxWriter, MOVIE_TIMESCALE, VIDEO_TIMESCALE};
use crate::error::{MuxError, MuxResult};
use crate::interleave::{run_writer, ChunkQueue, Output, WriterOutcome};
use crate::mp4::{self, GeoData, MovieInfo, TrackHandler, TrackInfo};
use crate::nal;
use crate::source::SampleSource;
use crate::track::{SharedDrift, TrackContext, TrackOutcome, TrackRunner, TrackStats};

/// Notifications emitted during recording. Delivered on a channel so
/// callers can react without blocking the recording threads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MuxerEvent {
    /// The approaching-size check tripped; the muxer is winding down.
    MaxFileSizeReached,
    /// A track reached the configured duration limit.
    MaxDurationReached,
    /// Periodic per-track recording progress.
    TrackProgress { track_id: u32, time_us: i64 },
    /// A track thread finished, cleanly or with an error.
    TrackCompleted { track_id: u32, error: Option<String> },
    /// The writer thread hit an unrecoverable error.
    Fatal { message: String },
}

/// Limits for absorbing audio/video clock drift into video timestamps.
#[derive(Clone, Copy, Debug)]
pub struct DriftConfig {
    /// How often the drift estimate is folded into timestamps.
    pub adjust_period_us: i64,
    /// Largest correction allowed on a single frame.
    pub max_per_frame_adjust_us: i64,
    /// Largest drift per period, in thousandths of the period length.
    pub max_period_drift_permille: i64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            adjust_period_us: 600_000_000,
            max_per_frame_adjust_us: 5_000,
            max_period_drift_permille: 5,
        }
    }
}

/// Sizing rules for the free-space reserve that precedes mdat.
#[derive(Clone, Copy, Debug)]
pub struct MoovReserveConfig {
    pub min_bytes: u64,
    pub max_bytes: u64,
    /// Reserve as thousandths of the file size limit, when one is set.
    pub per_mille_of_size_limit: u64,
    /// Expected total bitrate, used with a duration limit to size the
    /// reserve when no file size limit is given.
    pub bitrate_hint: Option<u32>,
}

impl Default for MoovReserveConfig {
    fn default() -> Self {
        Self {
            min_bytes: 3 * 1024,
            max_bytes: 405_000,
            per_mille_of_size_limit: 6,
            bitrate_hint: None,
        }
    }
}

/// Configuration for creating a recording muxer.
#[derive(Clone, Debug)]
pub struct MuxerConfig {
    /// Output file path.
    pub output_path: PathBuf,
    /// Stop recording when the estimated file size approaches this.
    pub max_file_size_bytes: Option<u64>,
    /// Stop recording when any track reaches this duration.
    pub max_duration_us: Option<i64>,
    /// Force 64-bit chunk offsets. Implied by a size limit over 4 GiB.
    pub use_64bit_offsets: bool,
    /// NAL length prefix width for AVC: four bytes, or two when false.
    pub use_4byte_nal_length: bool,
    /// Whether sources run against the wall clock; enables drift
    /// correction between audio and video.
    pub real_time: bool,
    /// Media time gathered into one chunk before it is handed to the
    /// writer. Zero writes every sample as its own chunk.
    pub interleave_duration_us: i64,
    /// Emit `TrackProgress` roughly this often, in media time.
    pub progress_interval_us: Option<i64>,
    /// Movie-level timescale.
    pub movie_timescale: u32,
    /// Optional geotag recorded in udta.
    pub geodata: Option<GeoData>,
    pub drift: DriftConfig,
    pub moov_reserve: MoovReserveConfig,
}

impl MuxerConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            max_file_size_bytes: None,
            max_duration_us: None,
            use_64bit_offsets: false,
            use_4byte_nal_length: true,
            real_time: true,
            interleave_duration_us: 1_000_000,
            progress_interval_us: None,
            movie_timescale: MOVIE_TIMESCALE,
            geodata: None,
            drift: DriftConfig::default(),
            moov_reserve: MoovReserveConfig::default(),
        }
    }
}

/// Per-track knobs supplied alongside a source.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackOptions {
    /// Track timescale override. Defaults to 90 kHz for video and the
    /// sample rate for audio.
    pub timescale: Option<u32>,
    /// Display rotation, video only.
    pub rotation: Rotation,
    /// Shift this track's start within the movie, for sources that
    /// begin late on purpose.
    pub start_time_offset_us: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MuxerState {
    Created,
    Started,
    Paused,
    Stopped,
}

/// Track registered but not yet recording.
struct PendingTrack {
    track_id: u32,
    format: MediaFormat,
    timescale: u32,
    rotation: Rotation,
    start_time_offset_us: i64,
    codec_config: Option<Vec<u8>>,
    source: Box<dyn SampleSource>,
}

/// Track with a live puller thread.
struct ActiveTrack {
    track_id: u32,
    format: MediaFormat,
    rotation: Rotation,
    timescale: u32,
    stats: Arc<TrackStats>,
    handle: JoinHandle<TrackOutcome>,
}

/// MP4 muxer that records pulled samples to a file.
///
/// Lifecycle: add sources while `Created`, then `start()`, optionally
/// `pause()`/`resume()`, and `stop()` to finalize the file. Dropping a
/// running muxer stops it.
pub struct Mp4Muxer {
    config: MuxerConfig,
    state: MuxerState,
    output: Arc<Mutex<Output>>,
    pending: Vec<PendingTrack>,
    active: Vec<ActiveTrack>,
    writer_handle: Option<JoinHandle<WriterOutcome>>,
    events_tx: Sender<MuxerEvent>,
    events_rx: Receiver<MuxerEvent>,
    movie_start_us: Arc<Mutex<Option<i64>>>,
    streamable: Arc<AtomicBool>,
    use_64bit_offsets: bool,
    moov_reserve_bytes: u64,
    /// File offset of the reserve free box (and of the moov when it fits).
    reserve_start: u64,
    /// File offset of the mdat box header, patched at stop.
    mdat_header_pos: u64,
    has_3gpp_track: bool,
}

impl Mp4Muxer {
    /// Create a muxer writing to the configured path. The file is
    /// created immediately; nothing is written until `start()`.
    pub fn new(config: MuxerConfig) -> MuxResult<Self> {
        validate_config(&config)?;

        let file = File::create(&config.output_path).map_err(|e| {
            MuxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create output file {:?}: {}", config.output_path, e),
            ))
        })?;
        let output = Arc::new(Mutex::new(Output::new(file)?));
        let (events_tx, events_rx) = unbounded();

        Ok(Self {
            config,
            state: MuxerState::Created,
            output,
            pending: Vec::new(),
            active: Vec::new(),
            writer_handle: None,
            events_tx,
            events_rx,
            movie_start_us: Arc::new(Mutex::new(None)),
            streamable: Arc::new(AtomicBool::new(true)),
            use_64bit_offsets: false,
            moov_reserve_bytes: 0,
            reserve_start: 0,
            mdat_header_pos: 0,
            has_3gpp_track: false,
        })
    }

    /// Register a sample source as a new track. Returns the 1-based
    /// track ID. Only allowed before `start()`.
    pub fn add_source(
        &mut self,
        source: Box<dyn SampleSource>,
        options: TrackOptions,
    ) -> MuxResult<u32> {
        if self.state != MuxerState::Created {
            return Err(MuxError::InvalidState(
                "Cannot add a source after start".into(),
            ));
        }

        let format = source.format();
        validate_format(&format.media)?;

        let timescale = match options.timescale {
            Some(0) => {
                return Err(MuxError::InvalidConfig("Track timescale must not be zero".into()))
            }
            Some(ts) => ts,
            None => match &format.media {
                MediaFormat::Video { .. } => VIDEO_TIMESCALE,
                MediaFormat::Audio { sample_rate, .. } => *sample_rate,
            },
        };
        if options.start_time_offset_us < 0 {
            return Err(MuxError::InvalidConfig(
                "Track start time offset must not be negative".into(),
            ));
        }

        let codec_config = match format.codec_config {
            Some(config_data) => Some(self.prepare_codec_config(&format.media, &config_data)?),
            None => None,
        };

        let track_id = (self.pending.len() + 1) as u32;
        self.pending.push(PendingTrack {
            track_id,
            format: format.media.clone(),
            timescale,
            rotation: options.rotation,
            start_time_offset_us: options.start_time_offset_us,
            codec_config,
            source,
        });

        info!(track_id, mime = format.media.mime_type(), timescale, "Added track");
        Ok(track_id)
    }

    /// Write the file skeleton and launch the recording threads.
    pub fn start(&mut self) -> MuxResult<()> {
        if self.state != MuxerState::Created {
            return Err(MuxError::InvalidState("Cannot start: already started".into()));
        }
        if self.pending.is_empty() {
            return Err(MuxError::InvalidConfig("No tracks added".into()));
        }

        self.use_64bit_offsets = self.config.use_64bit_offsets
            || self
                .config
                .max_file_size_bytes
                .is_some_and(|limit| limit > u32::MAX as u64);
        self.moov_reserve_bytes = self.estimate_moov_reserve();
        self.has_3gpp_track = self.pending.iter().any(|t| uses_3gpp_brand(&t.format));

        self.write_skeleton()?;
        self.start_tracks()?;

        self.state = MuxerState::Started;
        info!(
            tracks = self.active.len(),
            use_64bit_offsets = self.use_64bit_offsets,
            reserve_bytes = self.moov_reserve_bytes,
            "Muxer started"
        );
        Ok(())
    }

    /// Suspend recording: samples delivered while paused are dropped.
    pub fn pause(&mut self) -> MuxResult<()> {
        match self.state {
            MuxerState::Paused => return Ok(()),
            MuxerState::Started => {}
            _ => return Err(MuxError::InvalidState("Cannot pause: not recording".into())),
        }
        for track in &self.active {
            track.stats.paused.store(true, Ordering::SeqCst);
        }
        self.state = MuxerState::Paused;
        info!("Muxer paused");
        Ok(())
    }

    /// Resume after `pause()`. The gap in wall-clock time is excised
    /// from every track's timeline.
    pub fn resume(&mut self) -> MuxResult<()> {
        match self.state {
            MuxerState::Started => return Ok(()),
            MuxerState::Paused => {}
            _ => return Err(MuxError::InvalidState("Cannot resume: not paused".into())),
        }
        for track in &self.active {
            // Resume must be visible before the paused flag clears so
            // the first kept sample triggers the timeline correction.
            track.stats.resume_pending.store(true, Ordering::SeqCst);
            track.stats.paused.store(false, Ordering::SeqCst);
        }
        self.state = MuxerState::Started;
        info!("Muxer resumed");
        Ok(())
    }

    /// Finish recording: drain the threads, patch mdat, and write the
    /// moov box. Returns the first track or writer error, in which
    /// case no moov is written. Safe to call again once stopped.
    pub fn stop(&mut self) -> MuxResult<()> {
        match self.state {
            MuxerState::Stopped => return Ok(()),
            MuxerState::Created => {
                self.state = MuxerState::Stopped;
                return Ok(());
            }
            MuxerState::Started | MuxerState::Paused => {}
        }
        self.state = MuxerState::Stopped;

        for track in &self.active {
            track.stats.done.store(true, Ordering::SeqCst);
        }

        let mut first_error: Option<MuxError> = None;
        let mut finished: Vec<(MediaFormat, Rotation, u32, TrackOutcome)> = Vec::new();
        for track in std::mem::take(&mut self.active) {
            let ActiveTrack {
                track_id,
                format,
                rotation,
                timescale,
                handle,
                ..
            } = track;
            match handle.join() {
                Ok(mut outcome) => {
                    let status = std::mem::replace(&mut outcome.status, Ok(()));
                    if let Err(e) = status {
                        warn!(track_id, error = %e, "Track finished with error");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    finished.push((format, rotation, timescale, outcome));
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(MuxError::InvalidState(format!(
                            "Track {} thread panicked",
                            track_id
                        )));
                    }
                }
            }
        }

        let writer_outcome = match self.writer_handle.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => {
                    if let Err(e) = &outcome.status {
                        if first_error.is_none() {
                            first_error = Some(MuxError::InvalidState(format!(
                                "Writer thread failed: {}",
                                e
                            )));
                        }
                    }
                    Some(outcome)
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error =
                            Some(MuxError::InvalidState("Writer thread panicked".into()));
                    }
                    None
                }
            },
            None => None,
        };

        self.patch_mdat_size().map_err(|e| {
            error!(error = %e, "Failed to patch mdat size");
            e
        })?;

        if let Some(e) = first_error {
            warn!(error = %e, "Recording failed; no moov written");
            return Err(e);
        }

        self.write_moov(finished, writer_outcome)?;

        info!(
            bytes = self.output.lock().position(),
            streamable = self.is_file_streamable(),
            "Muxer stopped"
        );
        Ok(())
    }

    /// Receiver for recording notifications. May be cloned freely.
    pub fn events(&self) -> Receiver<MuxerEvent> {
        self.events_rx.clone()
    }

    /// Whether the finished file has its moov ahead of the media data.
    /// Meaningful after `stop()`.
    pub fn is_file_streamable(&self) -> bool {
        self.streamable.load(Ordering::SeqCst)
    }

    fn prepare_codec_config(&self, media: &MediaFormat, data: &[u8]) -> MuxResult<Vec<u8>> {
        match media {
            MediaFormat::Video { codec: VideoCodec::Avc, .. } => {
                nal::build_avc_record(data, self.config.use_4byte_nal_length)
            }
            MediaFormat::Video { codec: VideoCodec::Mpeg4Visual, .. } => Ok(data.to_vec()),
            MediaFormat::Audio { codec: AudioCodec::Aac, .. } => Ok(data.to_vec()),
            _ => Err(MuxError::InvalidConfig(format!(
                "Codec {} does not take configuration data",
                media.mime_type()
            ))),
        }
    }

    /// Reserve sizing: a per-mille slice of the size limit, or the
    /// limit-duration bitrate estimate, clamped and doubled for 64-bit
    /// offsets. With neither limit the minimum applies.
    fn estimate_moov_reserve(&self) -> u64 {
        let rules = &self.config.moov_reserve;
        let from_size = self
            .config
            .max_file_size_bytes
            .filter(|limit| *limit > 0)
            .map(|limit| limit * rules.per_mille_of_size_limit / 1000);
        let from_duration = match (self.config.max_duration_us, rules.bitrate_hint) {
            (Some(duration), Some(bitrate)) if duration > 0 && bitrate > 0 => {
                Some((bitrate as u128 * duration as u128 / 1_000_000 * 6 / 8000) as u64)
            }
            _ => None,
        };
        let estimate = match (from_size, from_duration) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => rules.min_bytes,
        };
        let clamped = estimate.clamp(rules.min_bytes, rules.max_bytes);
        if self.use_64bit_offsets {
            clamped * 2
        } else {
            clamped
        }
    }

    /// Write ftyp, the zeroed reserve, and the mdat header placeholder.
    fn write_skeleton(&mut self) -> MuxResult<()> {
        let ftyp = render_boxes(|bw| mp4::write_ftyp(bw, self.has_3gpp_track))?;

        let reserve = self.moov_reserve_bytes;
        let mut free_box = vec![0u8; reserve as usize];
        free_box[0..4].copy_from_slice(&(reserve as u32).to_be_bytes());
        free_box[4..8].copy_from_slice(b"free");

        let mut output = self.output.lock();
        output.append(&ftyp)?;
        self.reserve_start = output.append(&free_box)?;

        // mdat size is unknown until stop; a 64-bit file uses the
        // largesize form so the header never has to move.
        if self.use_64bit_offsets {
            let mut header = [0u8; 16];
            header[0..4].copy_from_slice(&1u32.to_be_bytes());
            header[4..8].copy_from_slice(b"mdat");
            self.mdat_header_pos = output.append(&header)?;
        } else {
            let mut header = [0u8; 8];
            header[4..8].copy_from_slice(b"mdat");
            self.mdat_header_pos = output.append(&header)?;
        }
        Ok(())
    }

    /// Start sources, then puller threads, then the writer. Rolls back
    /// anything already running if a later step fails.
    fn start_tracks(&mut self) -> MuxResult<()> {
        let mut tracks = std::mem::take(&mut self.pending);

        for (index, track) in tracks.iter_mut().enumerate() {
            if let Err(e) = track.source.start() {
                error!(track_id = track.track_id, error = %e, "Source failed to start");
                for started in &mut tracks[..index] {
                    if let Err(stop_err) = started.source.stop() {
                        warn!(track_id = started.track_id, error = %stop_err, "Source stop failed");
                    }
                }
                return Err(e.into());
            }
        }

        let single_track = tracks.len() == 1;
        let queue = if single_track {
            None
        } else {
            Some(Arc::new(ChunkQueue::new(tracks.len())))
        };
        let drift = Arc::new(SharedDrift::new());
        let drift_reference = tracks
            .iter()
            .position(|t| t.format.kind() == TrackKind::Audio);
        let all_stats: Arc<Vec<Arc<TrackStats>>> =
            Arc::new(tracks.iter().map(|_| TrackStats::new()).collect());
        let size_event_sent = Arc::new(AtomicBool::new(false));
        let duration_event_sent = Arc::new(AtomicBool::new(false));
        let offset_entry_bytes = if self.use_64bit_offsets { 8 } else { 4 };

        let mut remaining = tracks.into_iter().enumerate();
        while let Some((index, track)) = remaining.next() {
            let stats = Arc::clone(&all_stats[index]);
            let ctx = TrackContext {
                index,
                track_id: track.track_id,
                kind: track.format.kind(),
                timescale: track.timescale,
                start_time_offset_us: track.start_time_offset_us,
                is_avc: matches!(
                    track.format,
                    MediaFormat::Video { codec: VideoCodec::Avc, .. }
                ),
                four_byte_nal: self.config.use_4byte_nal_length,
                requires_codec_config: requires_codec_config(&track.format),
                real_time: self.config.real_time,
                drift_reference: drift_reference == Some(index),
                single_track,
                interleave_duration_us: self.config.interleave_duration_us,
                max_file_size_bytes: self.config.max_file_size_bytes,
                max_duration_us: self.config.max_duration_us,
                progress_interval_us: self.config.progress_interval_us,
                moov_reserve_bytes: self.moov_reserve_bytes,
                offset_entry_bytes,
                drift_config: self.config.drift,
                output: Arc::clone(&self.output),
                queue: queue.clone(),
                stats: Arc::clone(&stats),
                all_stats: Arc::clone(&all_stats),
                movie_start_us: Arc::clone(&self.movie_start_us),
                drift: Arc::clone(&drift),
                streamable: Arc::clone(&self.streamable),
                size_event_sent: Arc::clone(&size_event_sent),
                duration_event_sent: Arc::clone(&duration_event_sent),
                events: self.events_tx.clone(),
            };
            let runner = TrackRunner::new(ctx, track.source, track.codec_config);
            let handle = match std::thread::Builder::new()
                .name(format!("vcr-track-{}", track.track_id))
                .spawn(move || runner.run())
            {
                Ok(handle) => handle,
                Err(e) => {
                    // Sources past this point were started in the first
                    // pass but never handed to a puller thread.
                    stop_unspawned_sources(remaining.map(|(_, track)| track));
                    return Err(self.abort_started_tracks(e, queue.as_ref()));
                }
            };
            self.active.push(ActiveTrack {
                track_id: track.track_id,
                format: track.format,
                rotation: track.rotation,
                timescale: track.timescale,
                stats,
                handle,
            });
        }

        if let Some(queue) = &queue {
            let writer_queue = Arc::clone(queue);
            let writer_output = Arc::clone(&self.output);
            let writer_events = self.events_tx.clone();
            let handle = std::thread::Builder::new()
                .name("vcr-mdat-writer".into())
                .spawn(move || run_writer(writer_queue, writer_output, writer_events))
                .map_err(|e| self.abort_started_tracks(e, Some(queue)))?;
            self.writer_handle = Some(handle);
        }
        Ok(())
    }

    /// Thread spawn failed partway: wind down everything launched so
    /// far and surface the original error.
    fn abort_started_tracks(
        &mut self,
        cause: std::io::Error,
        queue: Option<&Arc<ChunkQueue>>,
    ) -> MuxError {
        error!(error = %cause, "Failed to spawn recording thread");
        for track in &self.active {
            track.stats.done.store(true, Ordering::SeqCst);
        }
        if let Some(queue) = queue {
            for index in self.active.len()..queue.track_count() {
                queue.mark_done(index);
            }
        }
        for track in std::mem::take(&mut self.active) {
            let _ = track.handle.join();
        }
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
        MuxError::Io(cause)
    }

    fn patch_mdat_size(&self) -> MuxResult<()> {
        let mut output = self.output.lock();
        let total = output.position() - self.mdat_header_pos;
        if self.use_64bit_offsets {
            output.patch_u64(self.mdat_header_pos + 8, total)
        } else if total > u32::MAX as u64 {
            Err(MuxError::Malformed(format!(
                "mdat grew to {} bytes, beyond the 32-bit box limit",
                total
            )))
        } else {
            output.patch_u32(self.mdat_header_pos, total as u32)
        }
    }

    /// Assemble the moov box and place it: into the reserve when it
    /// fits, appended after mdat otherwise.
    fn write_moov(
        &mut self,
        finished: Vec<(MediaFormat, Rotation, u32, TrackOutcome)>,
        writer_outcome: Option<WriterOutcome>,
    ) -> MuxResult<()> {
        let movie_start = (*self.movie_start_us.lock()).unwrap_or(0);
        let mut chunk_logs = writer_outcome.map(|o| o.logs);

        let mut track_infos = Vec::with_capacity(finished.len());
        let mut movie_duration_us = 0i64;
        for (format, rotation, timescale, outcome) in finished {
            let mut tables = outcome.tables;
            let log = match &mut chunk_logs {
                Some(logs) => std::mem::take(&mut logs[outcome.index]),
                None => outcome.chunk_log.unwrap_or_default(),
            };
            tables.chunk_offsets = log.offsets;
            tables.sample_to_chunk = log.sample_to_chunk;

            let start_us = outcome.start_ts_us - movie_start;
            movie_duration_us = movie_duration_us.max(start_us + outcome.duration_us);

            let codec_config = outcome.codec_config.unwrap_or_default();
            let handler = match format {
                MediaFormat::Video { codec, resolution } => TrackHandler::Video {
                    codec,
                    resolution,
                    rotation,
                    codec_config,
                },
                MediaFormat::Audio {
                    codec,
                    sample_rate,
                    channels,
                } => TrackHandler::Audio {
                    codec,
                    sample_rate,
                    channels,
                    codec_config,
                },
            };
            track_infos.push(TrackInfo {
                track_id: outcome.track_id,
                timescale,
                duration_us: outcome.duration_us,
                start_us,
                handler,
                tables,
            });
        }

        let movie = MovieInfo {
            timescale: self.config.movie_timescale,
            creation_time: mp4_creation_time(),
            duration_us: movie_duration_us,
            start_us: movie_start,
            next_track_id: track_infos.len() as u32 + 1,
            use_64bit_offsets: self.use_64bit_offsets,
            geodata: self.config.geodata,
        };
        let moov = render_boxes(|bw| mp4::write_moov(bw, &movie, &track_infos))?;

        let moov_len = moov.len() as u64;
        let reserve = self.moov_reserve_bytes;
        let mut output = self.output.lock();
        if moov_len == reserve || moov_len + 8 <= reserve {
            output.patch_at(self.reserve_start, &moov)?;
            if moov_len < reserve {
                // Remaining reserve becomes a free box; its body is
                // still zeroed from start().
                let mut header = [0u8; 8];
                header[0..4].copy_from_slice(&((reserve - moov_len) as u32).to_be_bytes());
                header[4..8].copy_from_slice(b"free");
                output.patch_at(self.reserve_start + moov_len, &header)?;
            }
        } else {
            warn!(
                moov_bytes = moov_len,
                reserve_bytes = reserve,
                "moov does not fit the reserve; appending"
            );
            output.append(&moov)?;
            self.streamable.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for Mp4Muxer {
    fn drop(&mut self) {
        if matches!(self.state, MuxerState::Started | MuxerState::Paused) {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Stop during drop failed");
            }
        }
    }
}

/// Render one or more boxes into an in-memory buffer.
fn render_boxes<F>(build: F) -> MuxResult<Vec<u8>>
where
    F: FnOnce(&mut BoxWriter<Cursor<Vec<u8>>>) -> MuxResult<()>,
{
    let mut bw = BoxWriter::new(Cursor::new(Vec::new()));
    build(&mut bw)?;
    Ok(bw.finish()?.into_inner())
}

fn validate_config(config: &MuxerConfig) -> MuxResult<()> {
    if config.interleave_duration_us < 0 {
        return Err(MuxError::InvalidConfig(
            "Interleave duration must not be negative".into(),
        ));
    }
    if config.movie_timescale == 0 {
        return Err(MuxError::InvalidConfig("Movie timescale must not be zero".into()));
    }
    if let Some(interval) = config.progress_interval_us {
        if interval <= 0 {
            return Err(MuxError::InvalidConfig(
                "Progress interval must be positive".into(),
            ));
        }
    }
    let reserve = &config.moov_reserve;
    if reserve.min_bytes < 16 || reserve.min_bytes > reserve.max_bytes {
        return Err(MuxError::InvalidConfig(
            "moov reserve bounds are inconsistent".into(),
        ));
    }
    // The reserve doubles for 64-bit offsets and is written as the
    // 32-bit size of the placeholder free box.
    if reserve.max_bytes > u64::from(u32::MAX) / 2 {
        return Err(MuxError::InvalidConfig(
            "moov reserve cap exceeds the 32-bit box size limit".into(),
        ));
    }
    Ok(())
}

/// Stop sources that were started but never handed to a puller thread.
fn stop_unspawned_sources<I>(tracks: I)
where
    I: IntoIterator<Item = PendingTrack>,
{
    for mut track in tracks {
        if let Err(e) = track.source.stop() {
            warn!(track_id = track.track_id, error = %e, "Source stop failed");
        }
    }
}

fn validate_format(media: &MediaFormat) -> MuxResult<()> {
    match media {
        MediaFormat::Video { resolution, .. } => {
            if resolution.width == 0 || resolution.height == 0 {
                return Err(MuxError::InvalidConfig(format!(
                    "Invalid video resolution {}",
                    resolution
                )));
            }
        }
        MediaFormat::Audio {
            codec,
            sample_rate,
            channels,
        } => {
            if *sample_rate == 0 || *channels == 0 {
                return Err(MuxError::InvalidConfig(
                    "Audio sample rate and channel count must be positive".into(),
                ));
            }
            if let Some(required) = codec.fixed_sample_rate() {
                if *sample_rate != required {
                    return Err(MuxError::InvalidConfig(format!(
                        "{} requires a {} Hz sample rate, got {}",
                        codec.display_name(),
                        required,
                        sample_rate
                    )));
                }
            }
            if matches!(codec, AudioCodec::AmrNb | AudioCodec::AmrWb) && *channels != 1 {
                return Err(MuxError::InvalidConfig(format!(
                    "{} is mono only",
                    codec.display_name()
                )));
            }
        }
    }
    Ok(())
}

fn requires_codec_config(media: &MediaFormat) -> bool {
    match media {
        MediaFormat::Video { codec, .. } => codec.requires_codec_config(),
        MediaFormat::Audio { codec, .. } => codec.requires_codec_config(),
    }
}

fn uses_3gpp_brand(media: &MediaFormat) -> bool {
    matches!(
        media,
        MediaFormat::Video { codec: VideoCodec::H263, .. }
            | MediaFormat::Audio {
                codec: AudioCodec::AmrNb | AudioCodec::AmrWb,
                ..
            }
    )
}
