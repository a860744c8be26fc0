//! MP4 box (atom) writers for ISO Base Media File Format (ISO 14496-12).
//!
//! This module writes the structural boxes that make up a finished
//! recording: ftyp and the whole moov tree (mvhd, trak, tkhd, edts,
//! mdia, mdhd, hdlr, minf, stbl, udta).
//!
//! The mdat (media data) box is written progressively by the muxer;
//! everything here operates on already-collected per-track tables.

use std::io::{Seek, Write};

use vcr_common::{AudioCodec, Resolution, Rotation, VideoCodec};

use crate::atoms::{encode_language, us_to_ticks, BoxWriter};
use crate::error::{MuxError, MuxResult};

/// Movie-level metadata for the moov box.
#[derive(Clone, Debug)]
pub struct MovieInfo {
    /// Movie timescale (ticks per second for movie-level durations).
    pub timescale: u32,
    /// Creation time in seconds since the MP4 epoch, shared by all headers.
    pub creation_time: u64,
    /// Longest track duration in microseconds.
    pub duration_us: i64,
    /// Earliest track start time in microseconds (movie zero point).
    pub start_us: i64,
    /// Next available track ID (written into mvhd).
    pub next_track_id: u32,
    /// Whether chunk offsets are written as 64-bit co64 entries.
    pub use_64bit_offsets: bool,
    /// Optional geotag written into udta.
    pub geodata: Option<GeoData>,
}

/// Geographic location tag, stored as a udta `©xyz` entry in
/// ISO 6709 "+DD.DDDD+DDD.DDDD/" form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoData {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoData {
    pub fn new(latitude: f64, longitude: f64) -> MuxResult<Self> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(MuxError::InvalidConfig(format!(
                "geodata out of range: lat {} lon {}",
                latitude, longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// ISO 6709 annex H string, e.g. "+37.4220-122.0840/".
    fn iso6709(&self) -> String {
        format!("{:+08.4}{:+09.4}/", self.latitude, self.longitude)
    }
}

/// Describes a finished track to be written into the moov box.
#[derive(Clone, Debug)]
pub struct TrackInfo {
    /// 1-based track ID.
    pub track_id: u32,
    /// Track timescale (ticks per second for media durations).
    pub timescale: u32,
    /// Total track duration in microseconds.
    pub duration_us: i64,
    /// First sample timestamp relative to the movie zero point, for edts.
    pub start_us: i64,
    /// Handler type: video or audio.
    pub handler: TrackHandler,
    /// Collected sample tables.
    pub tables: TrackTables,
}

/// Track media handler type.
#[derive(Clone, Debug)]
pub enum TrackHandler {
    Video {
        codec: VideoCodec,
        resolution: Resolution,
        rotation: Rotation,
        /// Assembled AVCDecoderConfigurationRecord for AVC, raw
        /// decoder-specific info for MPEG-4 Visual, empty for H.263.
        codec_config: Vec<u8>,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
        /// AudioSpecificConfig for AAC, empty for AMR.
        codec_config: Vec<u8>,
    },
}

impl TrackHandler {
    fn is_video(&self) -> bool {
        matches!(self, TrackHandler::Video { .. })
    }
}

/// One stsc run: chunks `first_chunk..` hold `samples_per_chunk` samples
/// each, until the next entry takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Per-track sample tables collected during recording.
#[derive(Clone, Debug, Default)]
pub struct TrackTables {
    /// Size in bytes of every sample, in decode order.
    pub sample_sizes: Vec<u32>,
    /// Run-length encoded sample durations in track timescale ticks.
    pub time_to_sample: Vec<(u32, u32)>,
    /// 1-based sample numbers of sync samples.
    pub sync_samples: Vec<u32>,
    /// Run-length encoded samples-per-chunk map.
    pub sample_to_chunk: Vec<StscEntry>,
    /// Absolute file offset of each chunk.
    pub chunk_offsets: Vec<u64>,
}

impl TrackTables {
    pub fn sample_count(&self) -> u32 {
        self.sample_sizes.len() as u32
    }
}

/// Write the ftyp (File Type) box.
///
/// Major brand isom, minor version 0x200; `3gp4` is added to the
/// compatible brands when the movie carries AMR or H.263 tracks.
pub fn write_ftyp<W: Write + Seek>(bw: &mut BoxWriter<W>, has_3gpp_track: bool) -> MuxResult<()> {
    bw.begin_box(b"ftyp")?;
    bw.write_fourcc(b"isom")?; // major brand
    bw.write_u32(0x200)?; // minor version
    bw.write_fourcc(b"isom")?;
    bw.write_fourcc(b"mp41")?;
    if has_3gpp_track {
        bw.write_fourcc(b"3gp4")?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write the complete moov (Movie) box with all tracks.
pub fn write_moov<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    tracks: &[TrackInfo],
) -> MuxResult<()> {
    bw.begin_box(b"moov")?;
    write_mvhd(bw, movie)?;
    for track in tracks {
        write_trak(bw, movie, track)?;
    }
    if movie.geodata.is_some() {
        write_udta(bw, movie)?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write the mvhd (Movie Header) box, version 0.
fn write_mvhd<W: Write + Seek>(bw: &mut BoxWriter<W>, movie: &MovieInfo) -> MuxResult<()> {
    bw.begin_full_box(b"mvhd", 0, 0)?;

    let duration = us_to_ticks(movie.duration_us, movie.timescale);

    bw.write_u32(movie.creation_time as u32)?; // creation_time
    bw.write_u32(movie.creation_time as u32)?; // modification_time
    bw.write_u32(movie.timescale)?; // timescale
    bw.write_u32(duration as u32)?; // duration

    bw.write_fixed_16_16(1.0)?; // rate (1.0 = normal)
    bw.write_fixed_8_8(1.0)?; // volume (1.0 = full)

    bw.write_zeros(10)?; // reserved

    // Unity matrix (16.16 fixed point; [2][2] is 2.30)
    bw.write_u32(0x0001_0000)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0x0001_0000)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0x4000_0000)?;

    bw.write_zeros(24)?; // pre-defined (6 x u32)

    bw.write_u32(movie.next_track_id)?; // next_track_ID

    bw.end_box()?;
    Ok(())
}

/// Write a complete trak (Track) box.
fn write_trak<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_box(b"trak")?;
    write_tkhd(bw, movie, track)?;
    if track.start_us > 0 {
        write_edts(bw, movie, track)?;
    }
    write_mdia(bw, movie, track)?;
    bw.end_box()?;
    Ok(())
}

/// Write the tkhd (Track Header) box, version 0.
fn write_tkhd<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    // flags = 0x000007 (track_enabled | track_in_movie | track_in_preview)
    bw.begin_full_box(b"tkhd", 0, 0x000007)?;

    let duration = us_to_ticks(track.duration_us, movie.timescale);

    bw.write_u32(movie.creation_time as u32)?; // creation_time
    bw.write_u32(movie.creation_time as u32)?; // modification_time
    bw.write_u32(track.track_id)?; // track_ID
    bw.write_zeros(4)?; // reserved
    bw.write_u32(duration as u32)?; // duration

    bw.write_zeros(8)?; // reserved (2 x u32)
    bw.write_i16(0)?; // layer
    bw.write_i16(0)?; // alternate_group
    match &track.handler {
        TrackHandler::Video { .. } => bw.write_fixed_8_8(0.0)?, // volume
        TrackHandler::Audio { .. } => bw.write_fixed_8_8(1.0)?,
    }
    bw.write_zeros(2)?; // reserved

    // Composition matrix: {a b u, c d v, x y w}; a..d are 16.16,
    // u/v/w are 2.30. Rotation is expressed here, not by swapping
    // the coded dimensions.
    let rotation = match &track.handler {
        TrackHandler::Video { rotation, .. } => *rotation,
        TrackHandler::Audio { .. } => Rotation::R0,
    };
    let (a, b, c, d) = match rotation {
        Rotation::R0 => (0x0001_0000u32, 0u32, 0u32, 0x0001_0000u32),
        Rotation::R90 => (0, 0x0001_0000, 0xFFFF_0000, 0),
        Rotation::R180 => (0xFFFF_0000, 0, 0, 0xFFFF_0000),
        Rotation::R270 => (0, 0xFFFF_0000, 0x0001_0000, 0),
    };
    bw.write_u32(a)?;
    bw.write_u32(b)?;
    bw.write_u32(0)?;
    bw.write_u32(c)?;
    bw.write_u32(d)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0)?;
    bw.write_u32(0x4000_0000)?;

    // Width and height in 16.16 fixed point; audio tracks carry zero.
    match &track.handler {
        TrackHandler::Video { resolution, .. } => {
            bw.write_fixed_16_16(resolution.width as f64)?;
            bw.write_fixed_16_16(resolution.height as f64)?;
        }
        TrackHandler::Audio { .. } => {
            bw.write_u32(0)?;
            bw.write_u32(0)?;
        }
    }

    bw.end_box()?;
    Ok(())
}

/// Write the edts/elst pair restoring a track's start offset relative
/// to the movie zero point. Media timestamps themselves start at zero.
fn write_edts<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_box(b"edts")?;
    bw.begin_full_box(b"elst", 0, 0)?;

    bw.write_u32(2)?; // entry_count

    // Empty edit covering the lead-in before the track starts.
    bw.write_u32(us_to_ticks(track.start_us, movie.timescale) as u32)?;
    bw.write_i32(-1)?; // media_time: empty edit
    bw.write_u32(0x0001_0000)?; // media_rate 1.0

    // The whole track plays from media time zero.
    bw.write_u32(us_to_ticks(track.duration_us, movie.timescale) as u32)?;
    bw.write_i32(0)?;
    bw.write_u32(0x0001_0000)?;

    bw.end_box()?;
    bw.end_box()?;
    Ok(())
}

/// Write the mdia (Media) box for a track.
fn write_mdia<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_box(b"mdia")?;
    write_mdhd(bw, movie, track)?;
    let handler_type = if track.handler.is_video() {
        b"vide"
    } else {
        b"soun"
    };
    write_hdlr(bw, handler_type)?;
    write_minf(bw, movie, track)?;
    bw.end_box()?;
    Ok(())
}

/// Write the mdhd (Media Header) box, version 0.
fn write_mdhd<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_full_box(b"mdhd", 0, 0)?;

    let duration = us_to_ticks(track.duration_us, track.timescale);

    bw.write_u32(movie.creation_time as u32)?;
    bw.write_u32(movie.creation_time as u32)?;
    bw.write_u32(track.timescale)?;
    bw.write_u32(duration as u32)?;

    // Language: "und" (undetermined)
    bw.write_u16(encode_language("und"))?;
    // Pre-defined
    bw.write_u16(0)?;

    bw.end_box()?;
    Ok(())
}

/// Write the hdlr (Handler Reference) box.
///
/// `handler_type` should be "vide" for video or "soun" for audio.
fn write_hdlr<W: Write + Seek>(bw: &mut BoxWriter<W>, handler_type: &[u8; 4]) -> MuxResult<()> {
    let name = match handler_type {
        b"vide" => "VideoHandler\0",
        b"soun" => "SoundHandler\0",
        _ => "DataHandler\0",
    };

    bw.begin_full_box(b"hdlr", 0, 0)?;
    bw.write_zeros(4)?; // pre_defined
    bw.write_fourcc(handler_type)?; // handler_type
    bw.write_zeros(12)?; // reserved (3 x u32)
    bw.write_bytes(name.as_bytes())?; // name (null-terminated)
    bw.end_box()?;
    Ok(())
}

/// Write the minf (Media Information) box.
fn write_minf<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_box(b"minf")?;

    match &track.handler {
        TrackHandler::Video { .. } => {
            // vmhd (Video Media Header)
            bw.begin_full_box(b"vmhd", 0, 0x000001)?;
            bw.write_u16(0)?; // graphicsmode
            bw.write_zeros(6)?; // opcolor (3 x u16)
            bw.end_box()?;
        }
        TrackHandler::Audio { .. } => {
            // smhd (Sound Media Header)
            bw.begin_full_box(b"smhd", 0, 0)?;
            bw.write_i16(0)?; // balance
            bw.write_zeros(2)?; // reserved
            bw.end_box()?;
        }
    }

    write_dinf(bw)?;
    write_stbl(bw, movie, track)?;

    bw.end_box()?;
    Ok(())
}

/// Write the dinf (Data Information) box with a dref (Data Reference) sub-box.
fn write_dinf<W: Write + Seek>(bw: &mut BoxWriter<W>) -> MuxResult<()> {
    bw.begin_box(b"dinf")?;
    bw.begin_full_box(b"dref", 0, 0)?;
    bw.write_u32(1)?; // entry_count
    // url entry, flag 1 = media data in same file
    bw.begin_full_box(b"url ", 0, 0x000001)?;
    bw.end_box()?;
    bw.end_box()?;
    bw.end_box()?;
    Ok(())
}

/// Write the stbl (Sample Table) box containing all sample metadata.
fn write_stbl<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    movie: &MovieInfo,
    track: &TrackInfo,
) -> MuxResult<()> {
    bw.begin_box(b"stbl")?;

    write_stsd(bw, &track.handler)?;
    write_stts(bw, &track.tables)?;
    if track.handler.is_video() {
        write_stss(bw, &track.tables)?;
    }
    write_stsz(bw, &track.tables)?;
    write_stsc(bw, &track.tables)?;
    if movie.use_64bit_offsets {
        write_co64(bw, &track.tables)?;
    } else {
        write_stco(bw, &track.tables)?;
    }

    bw.end_box()?;
    Ok(())
}

/// Write the stsd (Sample Description) box with a single entry for the
/// track's codec.
fn write_stsd<W: Write + Seek>(bw: &mut BoxWriter<W>, handler: &TrackHandler) -> MuxResult<()> {
    bw.begin_full_box(b"stsd", 0, 0)?;
    bw.write_u32(1)?; // entry_count

    match handler {
        TrackHandler::Video {
            codec,
            resolution,
            codec_config,
            ..
        } => {
            write_video_sample_entry(bw, *codec, *resolution, codec_config)?;
        }
        TrackHandler::Audio {
            codec,
            sample_rate,
            channels,
            codec_config,
        } => {
            write_audio_sample_entry(bw, *codec, *sample_rate, *channels, codec_config)?;
        }
    }

    bw.end_box()?;
    Ok(())
}

/// Write an avc1/mp4v/s263 VisualSampleEntry with its codec box.
fn write_video_sample_entry<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    codec: VideoCodec,
    resolution: Resolution,
    codec_config: &[u8],
) -> MuxResult<()> {
    let fourcc: &[u8; 4] = match codec {
        VideoCodec::Avc => b"avc1",
        VideoCodec::Mpeg4Visual => b"mp4v",
        VideoCodec::H263 => b"s263",
    };
    bw.begin_box(fourcc)?;

    // VisualSampleEntry fields
    bw.write_zeros(6)?; // reserved
    bw.write_u16(1)?; // data_reference_index
    bw.write_zeros(2)?; // pre_defined
    bw.write_zeros(2)?; // reserved
    bw.write_zeros(12)?; // pre_defined (3 x u32)
    bw.write_u16(resolution.width as u16)?;
    bw.write_u16(resolution.height as u16)?;
    bw.write_u32(0x0048_0000)?; // horizresolution (72 dpi, 16.16)
    bw.write_u32(0x0048_0000)?; // vertresolution (72 dpi, 16.16)
    bw.write_zeros(4)?; // reserved
    bw.write_u16(1)?; // frame_count
    bw.write_zeros(32)?; // compressorname (32 bytes, empty)
    bw.write_u16(0x0018)?; // depth (24-bit color)
    bw.write_i16(-1)?; // pre_defined

    match codec {
        VideoCodec::Avc => write_avcc(bw, codec_config)?,
        VideoCodec::Mpeg4Visual => write_esds(bw, 0x20, 0x11, 96_000, codec_config)?,
        VideoCodec::H263 => write_d263(bw)?,
    }

    bw.end_box()?;
    Ok(())
}

/// Write an mp4a/samr/sawb AudioSampleEntry with its codec box.
fn write_audio_sample_entry<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    codec: AudioCodec,
    sample_rate: u32,
    channels: u16,
    codec_config: &[u8],
) -> MuxResult<()> {
    let fourcc: &[u8; 4] = match codec {
        AudioCodec::Aac => b"mp4a",
        AudioCodec::AmrNb => b"samr",
        AudioCodec::AmrWb => b"sawb",
    };
    bw.begin_box(fourcc)?;

    // AudioSampleEntry fields
    bw.write_zeros(6)?; // reserved
    bw.write_u16(1)?; // data_reference_index
    bw.write_zeros(8)?; // reserved (2 x u32)
    bw.write_u16(channels)?; // channelcount
    bw.write_u16(16)?; // samplesize (16-bit)
    bw.write_zeros(2)?; // pre_defined
    bw.write_zeros(2)?; // reserved
    // Sample rate in 16.16 fixed point
    bw.write_u32(sample_rate << 16)?;

    match codec {
        AudioCodec::Aac => write_esds(bw, 0x40, 0x15, 128_000, codec_config)?,
        AudioCodec::AmrNb | AudioCodec::AmrWb => write_damr(bw)?,
    }

    bw.end_box()?;
    Ok(())
}

/// Write the avcC (AVC Decoder Configuration Record) box.
///
/// The record itself is assembled at track setup from the SPS/PPS
/// parameter sets; here it is written verbatim.
fn write_avcc<W: Write + Seek>(bw: &mut BoxWriter<W>, record: &[u8]) -> MuxResult<()> {
    bw.begin_box(b"avcC")?;
    bw.write_bytes(record)?;
    bw.end_box()?;
    Ok(())
}

/// Write the esds (Elementary Stream Descriptor) box.
///
/// `object_type` is 0x40 for AAC, 0x20 for MPEG-4 Visual;
/// `stream_type` is 0x15 for audio streams, 0x11 for visual streams.
fn write_esds<W: Write + Seek>(
    bw: &mut BoxWriter<W>,
    object_type: u8,
    stream_type: u8,
    bitrate: u32,
    config_data: &[u8],
) -> MuxResult<()> {
    bw.begin_full_box(b"esds", 0, 0)?;

    // Descriptor lengths count the body only; a nested descriptor
    // contributes its full size (tag + expandable length + body).
    let dsi_len = config_data.len();
    let dec_config_len = 13 + 1 + descr_length_size(dsi_len) + dsi_len;
    let es_desc_len = 3 + 1 + descr_length_size(dec_config_len) + dec_config_len + 3;

    bw.write_u8(0x03)?; // ES_DescrTag
    write_descr_length(bw, es_desc_len)?;
    bw.write_u16(1)?; // ES_ID
    bw.write_u8(0)?; // stream priority

    // DecoderConfigDescriptor tag=0x04
    bw.write_u8(0x04)?;
    write_descr_length(bw, dec_config_len)?;
    bw.write_u8(object_type)?; // objectTypeIndication
    bw.write_u8(stream_type)?; // streamType
    bw.write_zeros(3)?; // bufferSizeDB (24-bit)
    bw.write_u32(bitrate)?; // maxBitrate
    bw.write_u32(bitrate)?; // avgBitrate

    // DecoderSpecificInfo tag=0x05
    bw.write_u8(0x05)?;
    write_descr_length(bw, config_data.len())?;
    bw.write_bytes(config_data)?;

    // SLConfigDescriptor tag=0x06
    bw.write_u8(0x06)?;
    write_descr_length(bw, 1)?;
    bw.write_u8(0x02)?; // predefined = MP4

    bw.end_box()?;
    Ok(())
}

/// Encoded size in bytes of an expandable descriptor length field.
fn descr_length_size(len: usize) -> usize {
    let mut size = 1;
    let mut val = len >> 7;
    while val > 0 {
        size += 1;
        val >>= 7;
    }
    size
}

/// Write MPEG-4 descriptor length in expandable form (1-4 bytes).
fn write_descr_length<W: Write + Seek>(bw: &mut BoxWriter<W>, len: usize) -> MuxResult<()> {
    if len < 128 {
        bw.write_u8(len as u8)?;
    } else {
        let mut val = len;
        let mut bytes = Vec::new();
        loop {
            bytes.push((val & 0x7F) as u8);
            val >>= 7;
            if val == 0 {
                break;
            }
        }
        bytes.reverse();
        for (i, b) in bytes.iter().enumerate() {
            if i < bytes.len() - 1 {
                bw.write_u8(b | 0x80)?;
            } else {
                bw.write_u8(*b)?;
            }
        }
    }
    Ok(())
}

/// Write the d263 (H.263 Specific) box.
fn write_d263<W: Write + Seek>(bw: &mut BoxWriter<W>) -> MuxResult<()> {
    bw.begin_box(b"d263")?;
    bw.write_bytes(b"   \0")?; // vendor
    bw.write_u8(0)?; // decoder version
    bw.write_u8(10)?; // level
    bw.write_u8(0)?; // profile
    bw.end_box()?;
    Ok(())
}

/// Write the damr (AMR Specific) box.
fn write_damr<W: Write + Seek>(bw: &mut BoxWriter<W>) -> MuxResult<()> {
    bw.begin_box(b"damr")?;
    bw.write_bytes(b"   \0")?; // vendor
    bw.write_u8(0)?; // decoder version
    bw.write_u16(0x83FF)?; // mode set: all modes
    bw.write_u8(0)?; // mode change period
    bw.write_u8(1)?; // frames per sample
    bw.end_box()?;
    Ok(())
}

/// Write stts (Decoding Time to Sample) box from run-length encoded durations.
fn write_stts<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"stts", 0, 0)?;
    bw.write_u32(tables.time_to_sample.len() as u32)?;
    for (count, delta) in &tables.time_to_sample {
        bw.write_u32(*count)?;
        bw.write_u32(*delta)?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write stss (Sync Sample) box; entries are 1-based sample numbers.
fn write_stss<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"stss", 0, 0)?;
    bw.write_u32(tables.sync_samples.len() as u32)?;
    for sample_number in &tables.sync_samples {
        bw.write_u32(*sample_number)?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write stsz (Sample Size) box, using the compact uniform form when
/// every sample has the same size.
fn write_stsz<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"stsz", 0, 0)?;

    let sizes = &tables.sample_sizes;
    let uniform = !sizes.is_empty() && sizes.iter().all(|s| *s == sizes[0]);

    if uniform {
        bw.write_u32(sizes[0])?; // sample_size (uniform)
        bw.write_u32(sizes.len() as u32)?; // sample_count
    } else {
        bw.write_u32(0)?; // sample_size = 0 (variable)
        bw.write_u32(sizes.len() as u32)?;
        for size in sizes {
            bw.write_u32(*size)?;
        }
    }

    bw.end_box()?;
    Ok(())
}

/// Write stsc (Sample to Chunk) box from the run-length chunk map.
fn write_stsc<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"stsc", 0, 0)?;
    bw.write_u32(tables.sample_to_chunk.len() as u32)?;
    for entry in &tables.sample_to_chunk {
        bw.write_u32(entry.first_chunk)?;
        bw.write_u32(entry.samples_per_chunk)?;
        bw.write_u32(1)?; // sample_description_index
    }
    bw.end_box()?;
    Ok(())
}

/// Write stco (Chunk Offset) box with 32-bit offsets.
fn write_stco<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"stco", 0, 0)?;
    bw.write_u32(tables.chunk_offsets.len() as u32)?;
    for offset in &tables.chunk_offsets {
        if *offset > u32::MAX as u64 {
            return Err(MuxError::Malformed(format!(
                "chunk offset {} exceeds 32-bit limit",
                offset
            )));
        }
        bw.write_u32(*offset as u32)?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write co64 (Chunk Offset 64-bit) box.
fn write_co64<W: Write + Seek>(bw: &mut BoxWriter<W>, tables: &TrackTables) -> MuxResult<()> {
    bw.begin_full_box(b"co64", 0, 0)?;
    bw.write_u32(tables.chunk_offsets.len() as u32)?;
    for offset in &tables.chunk_offsets {
        bw.write_u64(*offset)?;
    }
    bw.end_box()?;
    Ok(())
}

/// Write the udta (User Data) box carrying the geotag.
fn write_udta<W: Write + Seek>(bw: &mut BoxWriter<W>, movie: &MovieInfo) -> MuxResult<()> {
    let geodata = match &movie.geodata {
        Some(g) => g,
        None => return Ok(()),
    };
    let text = geodata.iso6709();

    bw.begin_box(b"udta")?;
    bw.begin_box(&[0xA9, b'x', b'y', b'z'])?;
    bw.write_u16(text.len() as u16)?;
    bw.write_u16(0x15C7)?; // language: packed "eng"
    bw.write_bytes(text.as_bytes())?;
    bw.end_box()?;
    bw.end_box()?;
    Ok(())
}
