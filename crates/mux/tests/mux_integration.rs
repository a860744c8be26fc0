//! End-to-end tests for the MP4 recording muxer.
//!
//! These tests drive the full pipeline with scripted sources, from
//! source registration through moov finalization, then re-parse the
//! produced file down to the sample tables.
//! Everything here is deterministic: chunk boundaries depend only on
//! sample timestamps, and the tests that interact with pause/resume
//! gate the source on a channel so ordering is controlled.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use vcr_common::{AudioCodec, Resolution, Sample, SourceError, SourceFormat, VideoCodec};
use vcr_mux::{Mp4Muxer, MuxError, MuxerConfig, MuxerEvent, SampleSource, TrackOptions};

// ---------------------------------------------------------------------------
// Helpers: scripted sources
// ---------------------------------------------------------------------------

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("vcr_mux_it_{}.mp4", name));
    path
}

fn test_sps() -> Vec<u8> {
    vec![0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x02, 0x80, 0xF6, 0xC0, 0x44, 0x00, 0x00]
}

fn test_pps() -> Vec<u8> {
    vec![0x68, 0xCE, 0x38, 0x80]
}

fn test_aac_config() -> Vec<u8> {
    vec![0x12, 0x10]
}

/// Annex-B SPS+PPS blob, as an encoder hands it over.
fn test_avc_csd() -> Vec<u8> {
    let mut csd = vec![0, 0, 0, 1];
    csd.extend_from_slice(&test_sps());
    csd.extend_from_slice(&[0, 0, 0, 1]);
    csd.extend_from_slice(&test_pps());
    csd
}

/// Source that replays a fixed sample list and then signals end of stream.
struct ScriptedSource {
    format: SourceFormat,
    samples: VecDeque<Sample>,
}

impl ScriptedSource {
    fn new(format: SourceFormat, samples: Vec<Sample>) -> Box<Self> {
        Box::new(Self {
            format,
            samples: samples.into(),
        })
    }
}

impl SampleSource for ScriptedSource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Sample>, SourceError> {
        Ok(self.samples.pop_front())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Source fed live through a channel, so a test can interleave sample
/// delivery with muxer control calls. Dropping the sender ends the
/// stream. Each read sends one ack before blocking, so after the test
/// sees n+1 acks it knows all n delivered samples are fully ingested
/// and the puller is parked waiting for the next.
struct ChannelSource {
    format: SourceFormat,
    rx: Receiver<Sample>,
    ack_tx: Sender<()>,
}

impl ChannelSource {
    fn new(format: SourceFormat) -> (Box<Self>, Sender<Sample>, Receiver<()>) {
        let (tx, rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        (Box::new(Self { format, rx, ack_tx }), tx, ack_rx)
    }
}

impl SampleSource for ChannelSource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Sample>, SourceError> {
        let _ = self.ack_tx.send(());
        Ok(self.rx.recv().ok())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

fn wait_acks(acks: &Receiver<()>, count: usize) {
    for _ in 0..count {
        acks.recv_timeout(Duration::from_secs(10))
            .expect("source was never polled again");
    }
}

/// Wait until `count` tracks report completion, so a later stop()
/// cannot cancel a scripted source mid-script. Returns the events
/// drained while waiting.
fn await_tracks(events: &Receiver<MuxerEvent>, count: usize) -> Vec<MuxerEvent> {
    let mut drained = Vec::new();
    let mut completed = 0;
    while completed < count {
        match events.recv_timeout(Duration::from_secs(10)) {
            Ok(event) => {
                if matches!(event, MuxerEvent::TrackCompleted { .. }) {
                    completed += 1;
                }
                drained.push(event);
            }
            Err(_) => panic!("only {} of {} tracks completed", completed, count),
        }
    }
    drained
}

/// Scripted source that flags when stop() is called.
struct StopTrackedSource {
    format: SourceFormat,
    samples: VecDeque<Sample>,
    stopped: Arc<AtomicBool>,
}

impl SampleSource for StopTrackedSource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Sample>, SourceError> {
        Ok(self.samples.pop_front())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Source whose start() always fails.
struct RefusingSource {
    format: SourceFormat,
}

impl SampleSource for RefusingSource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        Err(SourceError::FormatUnavailable("capture device busy".into()))
    }

    fn read(&mut self) -> Result<Option<Sample>, SourceError> {
        Ok(None)
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Source that errors partway through its script.
struct FaultySource {
    format: SourceFormat,
    samples: VecDeque<Sample>,
}

impl SampleSource for FaultySource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Sample>, SourceError> {
        match self.samples.pop_front() {
            Some(sample) => Ok(Some(sample)),
            None => Err(SourceError::ReadFailed("encoder died".into())),
        }
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Fake AVC frame in Annex-B form; IDR when `sync`.
fn avc_frame(size: usize, ts_us: i64, sync: bool) -> Sample {
    let mut data = vec![0, 0, 0, 1, if sync { 0x65 } else { 0x41 }];
    data.resize(5 + size, 0xAB);
    let mut sample = Sample::new(data, ts_us);
    sample.is_sync = sync;
    sample
}

fn aac_frame(size: usize, ts_us: i64) -> Sample {
    Sample::sync(vec![0xCD; size], ts_us)
}

fn avc_source(frame_count: usize, frame_size: usize) -> Box<ScriptedSource> {
    let mut samples = vec![Sample::codec_config(test_avc_csd())];
    for i in 0..frame_count {
        samples.push(avc_frame(frame_size, i as i64 * 33_333, i % 30 == 0));
    }
    ScriptedSource::new(SourceFormat::video(VideoCodec::Avc, Resolution::VGA), samples)
}

fn aac_source(frame_count: usize, frame_size: usize) -> Box<ScriptedSource> {
    let samples = (0..frame_count)
        .map(|i| aac_frame(frame_size, i as i64 * 23_220))
        .collect();
    ScriptedSource::new(
        SourceFormat::audio(AudioCodec::Aac, 44_100, 2).with_codec_config(test_aac_config()),
        samples,
    )
}

fn offline_config(path: &PathBuf) -> MuxerConfig {
    let mut config = MuxerConfig::new(path.clone());
    config.real_time = false;
    config
}

fn read_file(path: &PathBuf) -> Vec<u8> {
    let mut data = Vec::new();
    File::open(path).unwrap().read_to_end(&mut data).unwrap();
    data
}

// ---------------------------------------------------------------------------
// Helpers: minimal box parsing
// ---------------------------------------------------------------------------

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// All child boxes of a container payload, as (type, payload) pairs.
fn child_boxes(data: &[u8]) -> Vec<([u8; 4], &[u8])> {
    let mut children = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let size32 = be_u32(data, offset) as u64;
        let mut box_type = [0u8; 4];
        box_type.copy_from_slice(&data[offset + 4..offset + 8]);
        let (header, size) = if size32 == 1 {
            let large = u64::from_be_bytes(data[offset + 8..offset + 16].try_into().unwrap());
            (16usize, large)
        } else {
            (8usize, size32)
        };
        assert!(size >= header as u64, "degenerate box");
        let end = offset + size as usize;
        assert!(end <= data.len(), "box overruns container");
        children.push((box_type, &data[offset + header..end]));
        offset = end;
    }
    children
}

fn child<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
    child_boxes(data)
        .into_iter()
        .find(|(t, _)| t == fourcc)
        .map(|(_, payload)| payload)
}

/// Follow a path of nested containers down to one payload.
fn descend<'a>(mut data: &'a [u8], path: &[&[u8; 4]]) -> &'a [u8] {
    for fourcc in path {
        data = child(data, fourcc)
            .unwrap_or_else(|| panic!("missing box {:?}", std::str::from_utf8(*fourcc)));
    }
    data
}

/// All trak payloads inside moov, in file order.
fn traks(moov: &[u8]) -> Vec<&[u8]> {
    child_boxes(moov)
        .into_iter()
        .filter(|(t, _)| t == b"trak")
        .map(|(_, payload)| payload)
        .collect()
}

fn stbl_of<'a>(trak: &'a [u8]) -> &'a [u8] {
    descend(trak, &[b"mdia", b"minf", b"stbl"])
}

/// Parse stts into (count, delta) entries.
fn parse_stts(stbl: &[u8]) -> Vec<(u32, u32)> {
    let payload = child(stbl, b"stts").expect("no stts");
    let count = be_u32(payload, 4) as usize;
    (0..count)
        .map(|i| (be_u32(payload, 8 + i * 8), be_u32(payload, 12 + i * 8)))
        .collect()
}

/// Parse stsz into (uniform_size, per_sample_sizes).
fn parse_stsz(stbl: &[u8]) -> (u32, Vec<u32>) {
    let payload = child(stbl, b"stsz").expect("no stsz");
    let sample_size = be_u32(payload, 4);
    let count = be_u32(payload, 8) as usize;
    let sizes = if sample_size == 0 {
        (0..count).map(|i| be_u32(payload, 12 + i * 4)).collect()
    } else {
        Vec::new()
    };
    (sample_size, sizes)
}

fn parse_sample_count(stbl: &[u8]) -> u32 {
    let payload = child(stbl, b"stsz").expect("no stsz");
    be_u32(payload, 8)
}

/// Parse stco (or co64) into chunk offsets.
fn parse_chunk_offsets(stbl: &[u8]) -> Vec<u64> {
    if let Some(payload) = child(stbl, b"stco") {
        let count = be_u32(payload, 4) as usize;
        return (0..count).map(|i| be_u32(payload, 8 + i * 4) as u64).collect();
    }
    let payload = child(stbl, b"co64").expect("no stco or co64");
    let count = be_u32(payload, 4) as usize;
    (0..count)
        .map(|i| u64::from_be_bytes(payload[8 + i * 8..16 + i * 8].try_into().unwrap()))
        .collect()
}

/// Parse stsc into (first_chunk, samples_per_chunk, descriptor) triples.
fn parse_stsc(stbl: &[u8]) -> Vec<(u32, u32, u32)> {
    let payload = child(stbl, b"stsc").expect("no stsc");
    let count = be_u32(payload, 4) as usize;
    (0..count)
        .map(|i| {
            (
                be_u32(payload, 8 + i * 12),
                be_u32(payload, 12 + i * 12),
                be_u32(payload, 16 + i * 12),
            )
        })
        .collect()
}

/// Total samples implied by stsc runs over `chunk_count` chunks.
fn stsc_total(entries: &[(u32, u32, u32)], chunk_count: u32) -> u32 {
    let mut total = 0;
    for (i, (first, per_chunk, _)) in entries.iter().enumerate() {
        let until = entries
            .get(i + 1)
            .map(|(next_first, _, _)| *next_first)
            .unwrap_or(chunk_count + 1);
        total += (until - first) * per_chunk;
    }
    total
}

fn moov_of(data: &[u8]) -> &[u8] {
    child(data, b"moov").expect("no moov box")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn constant_rate_video_collapses_to_one_stts_run() {
    let path = temp_path("stts_run");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(avc_source(30, 64), TrackOptions::default())
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 1);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let moov = moov_of(&data);
    let stbl = stbl_of(traks(moov)[0]);

    // 33333us at 90kHz rounds to exactly 3000 ticks every frame.
    assert_eq!(parse_stts(stbl), vec![(30, 3000)]);
    assert_eq!(parse_sample_count(stbl), 30);

    // Uniform frame sizes collapse stsz to its fixed-size field:
    // 4-byte length prefix + 1 NAL header byte + 64 payload bytes.
    let (uniform, sizes) = parse_stsz(stbl);
    assert_eq!(uniform, 69);
    assert!(sizes.is_empty());
    std::fs::remove_file(&path).ok();
}

#[test]
fn single_track_audio_forms_one_chunk() {
    let path = temp_path("one_chunk");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(aac_source(20, 128), TrackOptions::default())
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 1);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let moov = moov_of(&data);
    let stbl = stbl_of(traks(moov)[0]);

    let offsets = parse_chunk_offsets(stbl);
    assert_eq!(offsets.len(), 1);
    assert_eq!(parse_stsc(stbl), vec![(1, 20, 1)]);

    // The chunk offset points at the first sample's bytes inside mdat.
    let first = offsets[0] as usize;
    assert_eq!(&data[first..first + 4], &[0xCD, 0xCD, 0xCD, 0xCD]);
    std::fs::remove_file(&path).ok();
}

#[test]
fn interleaved_tracks_chunk_on_media_time() {
    let path = temp_path("chunking");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(avc_source(90, 64), TrackOptions::default())
        .unwrap();
    muxer
        .add_source(aac_source(130, 128), TrackOptions::default())
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 2);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let moov = moov_of(&data);
    let all = traks(moov);
    assert_eq!(all.len(), 2);
    let video = stbl_of(all[0]);
    let audio = stbl_of(all[1]);

    // One-second interleave: three chunks per track over ~3s of media,
    // with the threshold-tripping sample opening each new chunk.
    let video_offsets = parse_chunk_offsets(video);
    let audio_offsets = parse_chunk_offsets(audio);
    assert_eq!(video_offsets.len(), 3);
    assert_eq!(audio_offsets.len(), 3);
    assert!(video_offsets.windows(2).all(|w| w[0] < w[1]));
    assert!(audio_offsets.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(parse_stsc(video), vec![(1, 31, 1), (3, 28, 1)]);
    assert_eq!(parse_stsc(audio), vec![(1, 44, 1), (3, 42, 1)]);
    assert_eq!(stsc_total(&parse_stsc(video), 3), 90);
    assert_eq!(stsc_total(&parse_stsc(audio), 3), 130);
    std::fs::remove_file(&path).ok();
}

#[test]
fn pause_gap_is_excised_from_the_timeline() {
    let path = temp_path("pause_gap");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    let (source, tx, acks) = ChannelSource::new(
        SourceFormat::audio(AudioCodec::Aac, 44_100, 2).with_codec_config(test_aac_config()),
    );
    muxer.add_source(source, TrackOptions::default()).unwrap();
    let events = muxer.events();
    muxer.start().unwrap();
    wait_acks(&acks, 1); // puller is up and parked on the channel

    for i in 0..3 {
        tx.send(aac_frame(96, i * 33_333)).unwrap();
    }
    wait_acks(&acks, 3); // all three ingested before the pause lands

    muxer.pause().unwrap();
    // Delivered while paused: must be dropped.
    tx.send(aac_frame(96, 120_000)).unwrap();
    tx.send(aac_frame(96, 153_333)).unwrap();
    wait_acks(&acks, 2); // both seen and discarded

    muxer.resume().unwrap();
    // Wall clock jumped to 1s; media time must continue the cadence.
    tx.send(aac_frame(96, 1_000_000)).unwrap();
    tx.send(aac_frame(96, 1_033_333)).unwrap();
    drop(tx);
    await_tracks(&events, 1);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let stbl = stbl_of(traks(moov_of(&data))[0]);

    // Five samples survived, and the pause left no hole: every delta is
    // the 33.33ms frame interval (1470 ticks at 44.1kHz).
    assert_eq!(parse_sample_count(stbl), 5);
    assert_eq!(parse_stts(stbl), vec![(5, 1470)]);
    std::fs::remove_file(&path).ok();
}

#[test]
fn late_track_gets_an_edit_list() {
    let path = temp_path("edts");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(avc_source(30, 64), TrackOptions::default())
        .unwrap();
    // Audio wakes up half a second after the video.
    let samples = (0..20)
        .map(|i| aac_frame(128, 500_000 + i * 23_220))
        .collect();
    muxer
        .add_source(
            ScriptedSource::new(
                SourceFormat::audio(AudioCodec::Aac, 44_100, 2)
                    .with_codec_config(test_aac_config()),
                samples,
            ),
            TrackOptions::default(),
        )
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 2);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let all = traks(moov_of(&data));

    // Video starts the movie: no edit list.
    assert!(child(all[0], b"edts").is_none());

    // Audio: empty edit covering the 500ms lead-in, then the media.
    let elst = descend(all[1], &[b"edts", b"elst"]);
    assert_eq!(be_u32(elst, 4), 2); // entry count
    assert_eq!(be_u32(elst, 8), 500); // lead-in, movie timescale 1000
    assert_eq!(be_u32(elst, 12), 0xFFFF_FFFF); // media_time -1: empty edit
    assert_eq!(be_u32(elst, 16), 0x0001_0000); // rate 1.0
    assert_eq!(be_u32(elst, 24), 0); // second entry plays from zero
    std::fs::remove_file(&path).ok();
}

#[test]
fn in_band_avc_config_builds_the_decoder_record() {
    let path = temp_path("avcc");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(avc_source(5, 64), TrackOptions::default())
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 1);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let stbl = stbl_of(traks(moov_of(&data))[0]);
    let stsd = child(stbl, b"stsd").unwrap();
    // First sample entry starts after version/flags + entry_count.
    let avc1 = child(&stsd[8..], b"avc1").unwrap();
    // Skip the 78-byte VisualSampleEntry body to the codec boxes.
    let avcc = child(&avc1[78..], b"avcC").unwrap();

    assert_eq!(avcc[0], 1); // configurationVersion
    assert_eq!(avcc[1], 0x42); // Baseline profile, from the SPS
    assert_eq!(avcc[4] & 0x03, 3); // 4-byte NAL lengths
    assert_eq!(avcc[5], 0xE0 | 1); // one SPS
    let sps_len = u16::from_be_bytes([avcc[6], avcc[7]]) as usize;
    assert_eq!(sps_len, test_sps().len());
    assert_eq!(&avcc[8..8 + sps_len], &test_sps()[..]);
    std::fs::remove_file(&path).ok();
}

#[test]
fn size_limited_recording_stays_under_the_limit() {
    let path = temp_path("size_limit");
    let mut config = offline_config(&path);
    config.max_file_size_bytes = Some(8192);
    let mut muxer = Mp4Muxer::new(config).unwrap();
    muxer
        .add_source(aac_source(500, 128), TrackOptions::default())
        .unwrap();
    let events = muxer.events();
    muxer.start().unwrap();
    let seen = await_tracks(&events, 1);
    muxer.stop().unwrap();

    assert!(seen.contains(&MuxerEvent::MaxFileSizeReached));

    // The 95% margin leaves room for the tables; the finished file fits.
    assert!(std::fs::metadata(&path).unwrap().len() <= 8192);
    assert!(muxer.is_file_streamable());
    std::fs::remove_file(&path).ok();
}

#[test]
fn two_byte_nal_lengths_reject_oversize_samples() {
    let path = temp_path("nal2_overflow");
    let mut config = offline_config(&path);
    config.use_4byte_nal_length = false;
    let mut muxer = Mp4Muxer::new(config).unwrap();

    let mut samples = vec![Sample::codec_config(test_avc_csd())];
    samples.push(avc_frame(64, 0, true));
    // 70KB NAL cannot be framed with a two-byte length.
    samples.push(avc_frame(70_000, 33_333, false));
    muxer
        .add_source(
            ScriptedSource::new(SourceFormat::video(VideoCodec::Avc, Resolution::QCIF), samples),
            TrackOptions::default(),
        )
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 1);
    assert!(matches!(muxer.stop(), Err(MuxError::Malformed(_))));

    let data = read_file(&path);
    assert!(!data.windows(4).any(|w| w == b"moov"));
    std::fs::remove_file(&path).ok();
}

#[test]
fn drift_out_of_tolerance_aborts_the_recording() {
    let path = temp_path("drift_abort");
    let mut config = MuxerConfig::new(path.clone());
    config.real_time = true;
    config.drift.adjust_period_us = 100_000;
    let mut muxer = Mp4Muxer::new(config).unwrap();

    // Channel-paced sources keep the drift sequence deterministic: the
    // video sees zero drift in its first period, then a wild 200ms
    // estimate when the period rolls over.
    let (video, video_tx, video_acks) =
        ChannelSource::new(SourceFormat::video(VideoCodec::Avc, Resolution::VGA));
    let (audio, audio_tx, audio_acks) = ChannelSource::new(
        SourceFormat::audio(AudioCodec::Aac, 44_100, 2).with_codec_config(test_aac_config()),
    );
    muxer.add_source(video, TrackOptions::default()).unwrap();
    muxer.add_source(audio, TrackOptions::default()).unwrap();
    let events = muxer.events();
    muxer.start().unwrap();
    wait_acks(&video_acks, 1);
    wait_acks(&audio_acks, 1);

    video_tx.send(Sample::codec_config(test_avc_csd())).unwrap();
    for i in 0..4 {
        video_tx.send(avc_frame(64, i * 33_333, i == 0)).unwrap();
    }
    wait_acks(&video_acks, 5); // first period fully ingested

    for i in 0..4 {
        let mut s = aac_frame(64, i * 23_220);
        s.drift_us = Some(200_000);
        audio_tx.send(s).unwrap();
    }
    wait_acks(&audio_acks, 4); // drift estimate settled at ~190ms

    // Crosses the 100ms adjustment period with ~190ms of new drift.
    video_tx.send(avc_frame(64, 133_332, false)).unwrap();
    drop(video_tx);
    drop(audio_tx);
    await_tracks(&events, 2);

    let result = muxer.stop();
    assert!(
        matches!(result, Err(MuxError::DriftOutOfTolerance(_))),
        "expected drift abort, got {:?}",
        result.err()
    );
    std::fs::remove_file(&path).ok();
}

#[test]
fn rotation_is_recorded_in_the_track_matrix() {
    let path = temp_path("rotation");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    let options = TrackOptions {
        rotation: vcr_common::Rotation::R90,
        ..TrackOptions::default()
    };
    muxer.add_source(avc_source(5, 64), options).unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 1);
    muxer.stop().unwrap();

    let data = read_file(&path);
    let tkhd = descend(traks(moov_of(&data))[0], &[b"tkhd"]);

    // 90 degrees: {0, 1, -1, 0} in 16.16, w = 1.0 in 2.30.
    assert_eq!(be_u32(tkhd, 40), 0);
    assert_eq!(be_u32(tkhd, 44), 0x0001_0000);
    assert_eq!(be_u32(tkhd, 52), 0xFFFF_0000);
    assert_eq!(be_u32(tkhd, 56), 0);
    assert_eq!(be_u32(tkhd, 72), 0x4000_0000);
    // Coded dimensions are not swapped by rotation.
    assert_eq!(be_u32(tkhd, 76), 640 << 16);
    assert_eq!(be_u32(tkhd, 80), 480 << 16);
    std::fs::remove_file(&path).ok();
}

#[test]
fn mdat_size_is_patched_to_cover_all_chunks() {
    let path = temp_path("mdat_patch");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    muxer
        .add_source(avc_source(40, 100), TrackOptions::default())
        .unwrap();
    muxer
        .add_source(aac_source(60, 77), TrackOptions::default())
        .unwrap();
    muxer.start().unwrap();
    await_tracks(&muxer.events(), 2);
    muxer.stop().unwrap();

    let data = read_file(&path);
    // Walk top-level boxes: sizes must tile the file exactly, which
    // fails if the mdat placeholder was never patched.
    let mut offset = 0usize;
    let mut seen = Vec::new();
    while offset + 8 <= data.len() {
        let size32 = be_u32(&data, offset) as u64;
        let size = if size32 == 1 {
            u64::from_be_bytes(data[offset + 8..offset + 16].try_into().unwrap())
        } else {
            size32
        };
        seen.push([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        offset += size as usize;
    }
    assert_eq!(offset, data.len());
    assert!(seen.contains(&*b"mdat"));

    // mdat payload equals the sum of all stored sample sizes.
    let moov = moov_of(&data);
    let mut media_bytes = 0u64;
    for trak in traks(moov) {
        let stbl = stbl_of(trak);
        let (uniform, sizes) = parse_stsz(stbl);
        let count = parse_sample_count(stbl) as u64;
        media_bytes += if uniform > 0 {
            uniform as u64 * count
        } else {
            sizes.iter().map(|s| *s as u64).sum::<u64>()
        };
    }
    let mdat_total: u64 = {
        let mut total = 0;
        let mut offset = 0usize;
        while offset + 8 <= data.len() {
            let size32 = be_u32(&data, offset) as u64;
            let (header, size) = if size32 == 1 {
                (
                    16u64,
                    u64::from_be_bytes(data[offset + 8..offset + 16].try_into().unwrap()),
                )
            } else {
                (8u64, size32)
            };
            if &data[offset + 4..offset + 8] == b"mdat" {
                total = size - header;
            }
            offset += size as usize;
        }
        total
    };
    assert_eq!(mdat_total, media_bytes);
    std::fs::remove_file(&path).ok();
}

#[test]
fn progress_events_fire_at_the_configured_interval() {
    let path = temp_path("progress");
    let mut config = offline_config(&path);
    config.progress_interval_us = Some(250_000);
    let mut muxer = Mp4Muxer::new(config).unwrap();
    muxer
        .add_source(avc_source(30, 64), TrackOptions::default())
        .unwrap();
    let events = muxer.events();
    muxer.start().unwrap();
    let seen = await_tracks(&events, 1);
    muxer.stop().unwrap();

    let times: Vec<i64> = seen
        .iter()
        .filter_map(|event| match event {
            MuxerEvent::TrackProgress { track_id: 1, time_us } => Some(*time_us),
            _ => None,
        })
        .collect();
    // 30 frames at 33.33ms: a report fires on the first sample at or
    // past each 250ms mark.
    assert_eq!(times, vec![266_664, 533_328, 799_992]);
    assert!(times.windows(2).all(|w| w[1] - w[0] >= 250_000));
    std::fs::remove_file(&path).ok();
}

#[test]
fn failed_start_stops_sources_already_started() {
    let path = temp_path("start_rollback");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    let stopped = Arc::new(AtomicBool::new(false));
    let samples: VecDeque<Sample> = (0..5).map(|i| aac_frame(128, i as i64 * 23_220)).collect();
    muxer
        .add_source(
            Box::new(StopTrackedSource {
                format: SourceFormat::audio(AudioCodec::Aac, 44_100, 2)
                    .with_codec_config(test_aac_config()),
                samples,
                stopped: Arc::clone(&stopped),
            }),
            TrackOptions::default(),
        )
        .unwrap();
    muxer
        .add_source(
            Box::new(RefusingSource {
                format: SourceFormat::video(VideoCodec::Avc, Resolution::VGA),
            }),
            TrackOptions::default(),
        )
        .unwrap();

    assert!(matches!(muxer.start(), Err(MuxError::Source(_))));
    // The first source was started in the same pass and must be wound
    // back down.
    assert!(stopped.load(Ordering::SeqCst));
    std::fs::remove_file(&path).ok();
}

#[test]
fn source_read_error_surfaces_from_stop() {
    let path = temp_path("read_error");
    let mut muxer = Mp4Muxer::new(offline_config(&path)).unwrap();
    let samples: VecDeque<Sample> = (0..3).map(|i| aac_frame(128, i as i64 * 23_220)).collect();
    muxer
        .add_source(
            Box::new(FaultySource {
                format: SourceFormat::audio(AudioCodec::Aac, 44_100, 2)
                    .with_codec_config(test_aac_config()),
                samples,
            }),
            TrackOptions::default(),
        )
        .unwrap();
    let events = muxer.events();
    muxer.start().unwrap();
    let seen = await_tracks(&events, 1);
    assert!(matches!(muxer.stop(), Err(MuxError::Source(_))));

    // The completion event carries the failure, and no moov was written.
    assert!(seen.iter().any(|event| matches!(
        event,
        MuxerEvent::TrackCompleted {
            track_id: 1,
            error: Some(_)
        }
    )));
    let data = read_file(&path);
    assert!(!data.windows(4).any(|w| w == b"moov"));
    std::fs::remove_file(&path).ok();
}
