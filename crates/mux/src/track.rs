//! Per-track recording state and the puller thread.
//!
//! Each added source runs on its own thread: pull a sample, normalize
//! its timestamp, convert it to storage framing, account for it in the
//! sample tables, and either write it directly (single-track files) or
//! queue it for the interleaving writer. All mutable table state lives
//! on this thread; only small atomics and the chunk queue are shared.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vcr_common::TrackKind;

use crate::atoms::{tick_duration_us, us_to_ticks};
use crate::error::{MuxError, MuxResult};
use crate::interleave::{Chunk, ChunkLog, ChunkQueue, Output};
use crate::mp4::{StscEntry, TrackTables};
use crate::muxer::{DriftConfig, MuxerEvent};
use crate::nal;
use crate::source::SampleSource;

/// Shared per-track counters and control flags. The muxer flips the
/// flags; the puller thread reads them between samples and keeps the
/// estimates current for limit checks.
pub(crate) struct TrackStats {
    pub estimated_size_bytes: AtomicU64,
    pub duration_us: AtomicI64,
    pub paused: AtomicBool,
    pub resume_pending: AtomicBool,
    pub done: AtomicBool,
}

impl TrackStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            estimated_size_bytes: AtomicU64::new(0),
            duration_us: AtomicI64::new(0),
            paused: AtomicBool::new(false),
            resume_pending: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }
}

/// Exponentially smoothed audio/video clock drift estimate, reported
/// by the reference audio track and consumed by video tracks.
pub(crate) struct SharedDrift(Mutex<i64>);

impl SharedDrift {
    pub fn new() -> Self {
        Self(Mutex::new(0))
    }

    pub fn report(&self, reported_us: i64) {
        let mut current = self.0.lock();
        *current = (reported_us + *current) / 2;
    }

    pub fn current_us(&self) -> i64 {
        *self.0.lock()
    }
}

/// Everything a puller thread needs from the muxer, snapshotted at
/// start. Shared pieces are behind `Arc`.
pub(crate) struct TrackContext {
    pub index: usize,
    pub track_id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub start_time_offset_us: i64,
    pub is_avc: bool,
    pub four_byte_nal: bool,
    pub requires_codec_config: bool,
    pub real_time: bool,
    pub drift_reference: bool,
    pub single_track: bool,
    pub interleave_duration_us: i64,
    pub max_file_size_bytes: Option<u64>,
    pub max_duration_us: Option<i64>,
    pub progress_interval_us: Option<i64>,
    pub moov_reserve_bytes: u64,
    pub offset_entry_bytes: u64,
    pub drift_config: DriftConfig,
    pub output: Arc<Mutex<Output>>,
    pub queue: Option<Arc<ChunkQueue>>,
    pub stats: Arc<TrackStats>,
    pub all_stats: Arc<Vec<Arc<TrackStats>>>,
    pub movie_start_us: Arc<Mutex<Option<i64>>>,
    pub drift: Arc<SharedDrift>,
    pub streamable: Arc<AtomicBool>,
    pub size_event_sent: Arc<AtomicBool>,
    pub duration_event_sent: Arc<AtomicBool>,
    pub events: Sender<MuxerEvent>,
}

/// Result of one sample passing through the timeline.
struct TimelineStep {
    /// Corrected timestamp in microseconds.
    ts_us: i64,
    /// Completed duration of the previous sample, in ticks.
    delta_ticks: Option<u32>,
    nudged: bool,
}

/// Timestamp normalization for one track: shifts the track to start at
/// zero, excises paused wall-clock time, quantizes to the track
/// timescale, and keeps tick times strictly increasing.
struct Timeline {
    timescale: u32,
    start_offset_us: i64,
    started: bool,
    resume_pending: bool,
    /// First raw timestamp (plus configured offset); the movie start
    /// candidate and later the edts offset base.
    start_ts_us: i64,
    /// Subtracted from every raw timestamp; grows across pauses.
    pause_offset_us: i64,
    last_ts_us: i64,
    last_ticks: i64,
    last_duration_us: i64,
    sample_count: u64,
}

impl Timeline {
    fn new(timescale: u32, start_offset_us: i64) -> Self {
        Self {
            timescale,
            start_offset_us,
            started: false,
            resume_pending: false,
            start_ts_us: 0,
            pause_offset_us: 0,
            last_ts_us: 0,
            last_ticks: 0,
            last_duration_us: 0,
            sample_count: 0,
        }
    }

    fn resume(&mut self) {
        self.resume_pending = true;
    }

    /// Raw first timestamp, for the movie start and edts offset.
    fn start_ts_us(&self) -> i64 {
        self.start_ts_us
    }

    /// Corrected timestamp of the newest sample.
    fn duration_us(&self) -> i64 {
        self.last_ts_us
    }

    /// Track duration once no more samples follow: the final sample is
    /// credited with the previous sample's duration.
    fn final_duration_us(&self) -> i64 {
        self.last_ts_us + self.last_duration_us
    }

    /// Steps 1-3: start offset, first-sample capture, pause excision.
    fn normalize(&mut self, raw_us: i64) -> MuxResult<i64> {
        let ts = raw_us + self.start_offset_us;
        if !self.started {
            self.started = true;
            self.start_ts_us = ts;
            self.pause_offset_us = ts;
        }
        if self.resume_pending {
            // Wall-clock time spent paused, minus one frame interval so
            // the first resumed sample continues the old cadence.
            let paused_us = (ts - self.pause_offset_us) - self.last_ts_us;
            self.pause_offset_us += paused_us - self.last_duration_us;
            self.resume_pending = false;
        }
        let ts = ts - self.pause_offset_us;
        if ts < 0 {
            return Err(MuxError::Malformed(format!(
                "timestamp went backwards: {} us before track start",
                -ts
            )));
        }
        Ok(ts)
    }

    /// Steps 4-5: quantize to ticks and enforce strict monotonicity.
    fn quantize(&mut self, ts_us: i64) -> TimelineStep {
        let mut ts = ts_us;
        let mut ticks = us_to_ticks(ts, self.timescale);
        let mut nudged = false;
        let mut delta_ticks = None;

        if self.sample_count > 0 {
            let mut delta = ticks - self.last_ticks;
            if delta <= 0 {
                ticks = self.last_ticks + 1;
                ts = self.last_ts_us + tick_duration_us(self.timescale);
                delta = 1;
                nudged = true;
            }
            self.last_duration_us = ts - self.last_ts_us;
            delta_ticks = Some(delta as u32);
        }

        self.last_ts_us = ts;
        self.last_ticks = ticks;
        self.sample_count += 1;

        TimelineStep {
            ts_us: ts,
            delta_ticks,
            nudged,
        }
    }
}

/// Gradual absorption of audio/video clock drift into video timestamps.
///
/// Once per adjustment period the change in the shared drift estimate
/// is taken as a correction target and spread linearly over the first
/// half of the next period's frames. Corrections too large to absorb
/// smoothly abort the recording.
struct DriftAdjuster {
    config: DriftConfig,
    period_start_ts_us: i64,
    period_start_drift_us: i64,
    frames_in_period: u64,
    /// Fully absorbed shift from completed periods.
    base_shift_us: i64,
    ramp_target_us: i64,
    ramp_applied_us: i64,
    ramp_step_us: i64,
}

impl DriftAdjuster {
    fn new(config: DriftConfig, first_ts_us: i64, initial_drift_us: i64) -> Self {
        Self {
            config,
            period_start_ts_us: first_ts_us,
            period_start_drift_us: initial_drift_us,
            frames_in_period: 0,
            base_shift_us: 0,
            ramp_target_us: 0,
            ramp_applied_us: 0,
            ramp_step_us: 0,
        }
    }

    fn adjust(&mut self, ts_us: i64, shared_drift_us: i64) -> MuxResult<i64> {
        if self.frames_in_period > 0
            && ts_us - self.period_start_ts_us >= self.config.adjust_period_us
        {
            self.begin_period(ts_us, shared_drift_us)?;
        }
        self.frames_in_period += 1;

        if self.ramp_applied_us != self.ramp_target_us {
            let next = self.ramp_applied_us + self.ramp_step_us;
            self.ramp_applied_us = if self.ramp_step_us >= 0 {
                next.min(self.ramp_target_us)
            } else {
                next.max(self.ramp_target_us)
            };
        }

        Ok(ts_us + self.base_shift_us + self.ramp_applied_us)
    }

    fn begin_period(&mut self, ts_us: i64, shared_drift_us: i64) -> MuxResult<()> {
        let delta = shared_drift_us - self.period_start_drift_us;
        let span = ts_us - self.period_start_ts_us;
        if delta.abs() * 1000 > span * self.config.max_period_drift_permille {
            return Err(MuxError::DriftOutOfTolerance(format!(
                "{} us drift over a {} us period",
                delta, span
            )));
        }

        let frames = (self.frames_in_period / 2).max(1) as i64;
        let step = delta / frames;
        if step.abs() >= self.config.max_per_frame_adjust_us {
            return Err(MuxError::DriftOutOfTolerance(format!(
                "{} us adjustment per frame",
                step
            )));
        }

        // Whatever the previous ramp did not reach is folded into the
        // base so cumulative shift stays consistent.
        self.base_shift_us += self.ramp_target_us;
        self.ramp_target_us = delta;
        self.ramp_applied_us = 0;
        self.ramp_step_us = step;
        self.period_start_ts_us = ts_us;
        self.period_start_drift_us = shared_drift_us;
        self.frames_in_period = 0;
        Ok(())
    }
}

/// Incrementally built stsz/stts/stss tables.
struct TableBuilder {
    sizes: Vec<u32>,
    sync_samples: Vec<u32>,
    runs: Vec<(u32, u32)>,
    open_run: Option<(u32, u32)>,
    uniform: bool,
    /// Sync entries are only kept for video; the stss box is never
    /// written for audio tracks.
    record_syncs: bool,
}

impl TableBuilder {
    fn new(record_syncs: bool) -> Self {
        Self {
            sizes: Vec::new(),
            sync_samples: Vec::new(),
            runs: Vec::new(),
            open_run: None,
            uniform: true,
            record_syncs,
        }
    }

    fn add_sample(&mut self, size: u32, is_sync: bool) {
        if let Some(first) = self.sizes.first() {
            if *first != size {
                self.uniform = false;
            }
        }
        self.sizes.push(size);
        if self.record_syncs && is_sync {
            self.sync_samples.push(self.sizes.len() as u32);
        }
    }

    /// Record the completed duration of the previous sample.
    fn add_delta(&mut self, delta_ticks: u32) {
        match &mut self.open_run {
            Some((count, delta)) if *delta == delta_ticks => *count += 1,
            Some(run) => {
                self.runs.push(*run);
                self.open_run = Some((1, delta_ticks));
            }
            None => self.open_run = Some((1, delta_ticks)),
        }
    }

    fn sample_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    fn sync_count(&self) -> usize {
        self.sync_samples.len()
    }

    /// Bytes these tables will occupy in the moov, for size estimates.
    fn table_bytes(&self, offset_entry_bytes: u64, chunk_count: u64) -> u64 {
        let stsz = if self.uniform {
            0
        } else {
            4 * self.sizes.len() as u64
        };
        let stts = 8 * (self.runs.len() as u64 + u64::from(self.open_run.is_some()));
        let stss = 4 * self.sync_samples.len() as u64;
        let chunk_tables = (offset_entry_bytes + 12) * chunk_count;
        stsz + stts + stss + chunk_tables
    }

    /// Close the tables: the final sample repeats the previous
    /// duration; a lone sample gets duration zero.
    fn finish(mut self) -> TrackTables {
        if let Some((count, delta)) = self.open_run.take() {
            self.runs.push((count + 1, delta));
        } else if self.sizes.len() == 1 {
            self.runs.push((1, 0));
        }
        TrackTables {
            sample_sizes: self.sizes,
            time_to_sample: self.runs,
            sync_samples: self.sync_samples,
            sample_to_chunk: Vec::new(),
            chunk_offsets: Vec::new(),
        }
    }
}

/// Result handed back when a puller thread is joined.
pub(crate) struct TrackOutcome {
    pub index: usize,
    pub track_id: u32,
    pub status: MuxResult<()>,
    /// Sample tables; chunk columns are filled in directly for
    /// single-track files and merged from the writer log otherwise.
    pub tables: TrackTables,
    pub chunk_log: Option<ChunkLog>,
    pub codec_config: Option<Vec<u8>>,
    pub start_ts_us: i64,
    pub duration_us: i64,
}

struct PendingChunk {
    first_ts_us: i64,
    samples: Vec<Vec<u8>>,
}

/// Puller thread body for one track.
pub(crate) struct TrackRunner {
    ctx: TrackContext,
    source: Box<dyn SampleSource>,
    codec_config: Option<Vec<u8>>,
    timeline: Timeline,
    tables: TableBuilder,
    drift_adjuster: Option<DriftAdjuster>,
    pending: PendingChunk,
    chunk_log: ChunkLog,
    chunks_sealed: u64,
    media_bytes: u64,
    zero_length_samples: u64,
    paused_discards: u64,
    movie_start_published: bool,
    last_progress_us: i64,
}

impl TrackRunner {
    pub fn new(
        ctx: TrackContext,
        source: Box<dyn SampleSource>,
        codec_config: Option<Vec<u8>>,
    ) -> Self {
        let timeline = Timeline::new(ctx.timescale, ctx.start_time_offset_us);
        let tables = TableBuilder::new(ctx.kind == TrackKind::Video);
        Self {
            ctx,
            source,
            codec_config,
            timeline,
            tables,
            drift_adjuster: None,
            pending: PendingChunk {
                first_ts_us: 0,
                samples: Vec::new(),
            },
            chunk_log: ChunkLog::default(),
            chunks_sealed: 0,
            media_bytes: 0,
            zero_length_samples: 0,
            paused_discards: 0,
            movie_start_published: false,
            last_progress_us: 0,
        }
    }

    pub fn run(mut self) -> TrackOutcome {
        info!(track_id = self.ctx.track_id, kind = %self.ctx.kind, "Track thread started");

        let status = self.pull_loop().and_then(|_| self.validate_end());

        if let Err(e) = self.source.stop() {
            warn!(track_id = self.ctx.track_id, error = %e, "Source stop failed");
        }

        if status.is_ok() {
            self.seal_pending_chunk();
        }
        if let Some(queue) = &self.ctx.queue {
            queue.mark_done(self.ctx.index);
        }

        if self.zero_length_samples > 0 {
            warn!(
                track_id = self.ctx.track_id,
                count = self.zero_length_samples,
                "Dropped zero-length samples"
            );
        }
        if self.paused_discards > 0 {
            debug!(
                track_id = self.ctx.track_id,
                count = self.paused_discards,
                "Discarded samples while paused"
            );
        }

        let _ = self.ctx.events.send(MuxerEvent::TrackCompleted {
            track_id: self.ctx.track_id,
            error: status.as_ref().err().map(|e| e.to_string()),
        });

        let sample_count = self.tables.sample_count();
        info!(
            track_id = self.ctx.track_id,
            samples = sample_count,
            duration_us = self.timeline.final_duration_us(),
            ok = status.is_ok(),
            "Track thread finished"
        );

        // Single-track files form one big chunk starting at the first
        // sample's offset.
        let chunk_log = if self.ctx.single_track {
            let mut log = self.chunk_log;
            if sample_count > 0 {
                log.sample_to_chunk = vec![StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: sample_count,
                }];
            }
            Some(log)
        } else {
            None
        };

        TrackOutcome {
            index: self.ctx.index,
            track_id: self.ctx.track_id,
            status,
            tables: self.tables.finish(),
            chunk_log,
            codec_config: self.codec_config,
            start_ts_us: self.timeline.start_ts_us(),
            duration_us: self.timeline.final_duration_us(),
        }
    }

    fn pull_loop(&mut self) -> MuxResult<()> {
        loop {
            if self.ctx.stats.done.load(Ordering::SeqCst) {
                debug!(track_id = self.ctx.track_id, "Stop requested");
                return Ok(());
            }

            let sample = match self.source.read()? {
                Some(sample) => sample,
                None => {
                    debug!(track_id = self.ctx.track_id, "End of stream");
                    return Ok(());
                }
            };

            if sample.is_codec_config {
                self.ingest_codec_config(&sample.data)?;
                continue;
            }
            if sample.data.is_empty() {
                self.zero_length_samples += 1;
                continue;
            }
            if self.ctx.stats.paused.load(Ordering::SeqCst) {
                self.paused_discards += 1;
                continue;
            }
            if self.ctx.stats.resume_pending.swap(false, Ordering::SeqCst) {
                self.timeline.resume();
            }

            let data = if self.ctx.is_avc {
                nal::length_prefixed(&sample.data, self.ctx.four_byte_nal)?
            } else {
                sample.data
            };

            let ts = self.timeline.normalize(sample.timestamp_us)?;
            if !self.movie_start_published {
                self.publish_movie_start();
            }

            let ts = self.adjust_for_drift(ts)?;
            if self.ctx.real_time && self.ctx.drift_reference {
                if let Some(drift_us) = sample.drift_us {
                    self.ctx.drift.report(drift_us);
                }
            }

            let step = self.timeline.quantize(ts);
            if step.nudged {
                warn!(
                    track_id = self.ctx.track_id,
                    ts_us = step.ts_us,
                    "Non-increasing timestamp nudged forward"
                );
            }
            if let Some(delta) = step.delta_ticks {
                self.tables.add_delta(delta);
            }
            self.tables.add_sample(data.len() as u32, sample.is_sync);
            self.ctx
                .stats
                .duration_us
                .store(self.timeline.duration_us(), Ordering::Relaxed);

            self.store_sample(step.ts_us, data)?;
            self.update_size_estimate();

            if self.exceeds_file_size_limit() {
                if !self.ctx.size_event_sent.swap(true, Ordering::SeqCst) {
                    let _ = self.ctx.events.send(MuxerEvent::MaxFileSizeReached);
                }
                info!(track_id = self.ctx.track_id, "File size limit reached");
                return Ok(());
            }
            if self.exceeds_duration_limit() {
                if !self.ctx.duration_event_sent.swap(true, Ordering::SeqCst) {
                    let _ = self.ctx.events.send(MuxerEvent::MaxDurationReached);
                }
                info!(track_id = self.ctx.track_id, "Duration limit reached");
                return Ok(());
            }

            if let Some(interval) = self.ctx.progress_interval_us {
                if step.ts_us - self.last_progress_us >= interval {
                    let _ = self.ctx.events.send(MuxerEvent::TrackProgress {
                        track_id: self.ctx.track_id,
                        time_us: step.ts_us,
                    });
                    self.last_progress_us = step.ts_us;
                }
            }
        }
    }

    fn ingest_codec_config(&mut self, data: &[u8]) -> MuxResult<()> {
        if !self.ctx.requires_codec_config {
            return Err(MuxError::Malformed(format!(
                "unexpected codec config on {} track {}",
                self.ctx.kind, self.ctx.track_id
            )));
        }
        if self.codec_config.is_some() {
            return Err(MuxError::Malformed(format!(
                "duplicate codec config on track {}",
                self.ctx.track_id
            )));
        }
        let config = if self.ctx.is_avc {
            nal::build_avc_record(data, self.ctx.four_byte_nal)?
        } else {
            data.to_vec()
        };
        debug!(
            track_id = self.ctx.track_id,
            bytes = config.len(),
            "Captured codec config"
        );
        self.codec_config = Some(config);
        Ok(())
    }

    fn publish_movie_start(&mut self) {
        let start = self.timeline.start_ts_us();
        let mut movie_start = self.ctx.movie_start_us.lock();
        match *movie_start {
            Some(current) if current <= start => {}
            _ => *movie_start = Some(start),
        }
        self.movie_start_published = true;
    }

    fn adjust_for_drift(&mut self, ts_us: i64) -> MuxResult<i64> {
        if !self.ctx.real_time || self.ctx.kind != TrackKind::Video {
            return Ok(ts_us);
        }
        let shared = self.ctx.drift.current_us();
        let adjuster = self
            .drift_adjuster
            .get_or_insert_with(|| DriftAdjuster::new(self.ctx.drift_config, ts_us, shared));
        adjuster.adjust(ts_us, shared)
    }

    fn store_sample(&mut self, ts_us: i64, data: Vec<u8>) -> MuxResult<()> {
        self.media_bytes += data.len() as u64;

        if self.ctx.single_track {
            let offset = self.ctx.output.lock().append(&data)?;
            if self.chunk_log.offsets.is_empty() {
                self.chunk_log.offsets.push(offset);
            }
            return Ok(());
        }

        // The sample that trips the interleave threshold starts the
        // next chunk rather than extending the sealed one.
        if !self.pending.samples.is_empty()
            && ts_us - self.pending.first_ts_us > self.ctx.interleave_duration_us
        {
            self.seal_pending_chunk();
        }
        if self.pending.samples.is_empty() {
            self.pending.first_ts_us = ts_us;
        }
        self.pending.samples.push(data);
        if self.ctx.interleave_duration_us == 0 {
            self.seal_pending_chunk();
        }
        Ok(())
    }

    fn seal_pending_chunk(&mut self) {
        if self.pending.samples.is_empty() {
            return;
        }
        if let Some(queue) = &self.ctx.queue {
            queue.submit(Chunk {
                track_index: self.ctx.index,
                first_ts_us: self.pending.first_ts_us,
                samples: std::mem::take(&mut self.pending.samples),
            });
            self.chunks_sealed += 1;
        }
    }

    fn update_size_estimate(&mut self) {
        let mut estimate = self.media_bytes;
        if !self.ctx.streamable.load(Ordering::SeqCst) {
            let chunk_count = if self.ctx.single_track {
                1
            } else {
                self.chunks_sealed + u64::from(!self.pending.samples.is_empty())
            };
            estimate += self
                .tables
                .table_bytes(self.ctx.offset_entry_bytes, chunk_count);
        }
        self.ctx
            .stats
            .estimated_size_bytes
            .store(estimate, Ordering::Relaxed);
    }

    /// Conservative check against the size limit: the moov reserve plus
    /// every track's estimate, compared to 95% of the target.
    fn exceeds_file_size_limit(&self) -> bool {
        let limit = match self.ctx.max_file_size_bytes {
            Some(limit) if limit > 0 => limit,
            _ => return false,
        };
        let mut total = self.ctx.moov_reserve_bytes;
        for stats in self.ctx.all_stats.iter() {
            total += stats.estimated_size_bytes.load(Ordering::Relaxed);
        }
        total >= limit.saturating_mul(95) / 100
    }

    fn exceeds_duration_limit(&self) -> bool {
        let limit = match self.ctx.max_duration_us {
            Some(limit) if limit > 0 => limit,
            _ => return false,
        };
        self.ctx
            .all_stats
            .iter()
            .any(|stats| stats.duration_us.load(Ordering::Relaxed) >= limit)
    }

    fn validate_end(&self) -> MuxResult<()> {
        if self.tables.sample_count() == 0 {
            return Err(MuxError::Malformed(format!(
                "track {} produced no samples",
                self.ctx.track_id
            )));
        }
        if self.ctx.requires_codec_config && self.codec_config.is_none() {
            return Err(MuxError::Malformed(format!(
                "track {} is missing codec config",
                self.ctx.track_id
            )));
        }
        if self.ctx.kind == TrackKind::Video && self.tables.sync_count() == 0 {
            return Err(MuxError::Malformed(format!(
                "video track {} has no sync samples",
                self.ctx.track_id
            )));
        }
        Ok(())
    }
}
