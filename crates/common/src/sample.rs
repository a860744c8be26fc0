//! Encoded samples and source format descriptions: the data half of the
//! contract between encoders/capture sources and the container writer.

use crate::codec::{AudioCodec, VideoCodec};
use crate::types::{Resolution, TrackKind};

/// One encoded access unit pulled from a sample source.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Encoded payload. AVC payloads may carry a leading Annex-B start code;
    /// the writer converts to length-prefixed form.
    pub data: Vec<u8>,
    /// Timestamp in microseconds, on the source's clock.
    pub timestamp_us: i64,
    /// Whether this sample is a sync point (IDR frame for AVC; every audio
    /// frame normally is).
    pub is_sync: bool,
    /// Whether this sample carries codec configuration rather than media
    /// data (SPS/PPS, AudioSpecificConfig, VOS/VOL header).
    pub is_codec_config: bool,
    /// Clock drift of the source against real time, reported by sources that
    /// measure it (typically the audio path). Microseconds; positive means
    /// the source clock runs behind.
    pub drift_us: Option<i64>,
}

impl Sample {
    pub fn new(data: Vec<u8>, timestamp_us: i64) -> Self {
        Self {
            data,
            timestamp_us,
            is_sync: false,
            is_codec_config: false,
            drift_us: None,
        }
    }

    pub fn sync(data: Vec<u8>, timestamp_us: i64) -> Self {
        Self {
            is_sync: true,
            ..Self::new(data, timestamp_us)
        }
    }

    /// A configuration sample (no media payload semantics).
    pub fn codec_config(data: Vec<u8>) -> Self {
        Self {
            is_codec_config: true,
            ..Self::new(data, 0)
        }
    }
}

/// Media parameters of a source, fixed for the lifetime of a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaFormat {
    Video {
        codec: VideoCodec,
        resolution: Resolution,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
    },
}

impl MediaFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Video { .. } => TrackKind::Video,
            Self::Audio { .. } => TrackKind::Audio,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Video { codec, .. } => codec.mime_type(),
            Self::Audio { codec, .. } => codec.mime_type(),
        }
    }
}

/// Full source description handed to the writer at track registration.
#[derive(Clone, Debug)]
pub struct SourceFormat {
    pub media: MediaFormat,
    /// Out-of-band codec configuration, when the source has it up front.
    /// Sources may instead deliver it as the first (flagged) sample.
    pub codec_config: Option<Vec<u8>>,
}

impl SourceFormat {
    pub fn video(codec: VideoCodec, resolution: Resolution) -> Self {
        Self {
            media: MediaFormat::Video { codec, resolution },
            codec_config: None,
        }
    }

    pub fn audio(codec: AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            media: MediaFormat::Audio {
                codec,
                sample_rate,
                channels,
            },
            codec_config: None,
        }
    }

    pub fn with_codec_config(mut self, config: Vec<u8>) -> Self {
        self.codec_config = Some(config);
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.media.kind()
    }
}
