//! Video/audio codec enums for the recording pipeline.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Avc,
    Mpeg4Visual,
    H263,
}

impl VideoCodec {
    /// MIME type as carried in source format metadata.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Avc => "video/avc",
            Self::Mpeg4Visual => "video/mp4v-es",
            Self::H263 => "video/3gpp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "video/avc" => Some(Self::Avc),
            "video/mp4v-es" => Some(Self::Mpeg4Visual),
            "video/3gpp" => Some(Self::H263),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Avc => "H.264/AVC",
            Self::Mpeg4Visual => "MPEG-4 Visual",
            Self::H263 => "H.263",
        }
    }

    /// Whether the writer must receive out-of-band codec configuration
    /// (SPS/PPS for AVC, the VOS/VOL header for MPEG-4 Visual) before
    /// the track can be finalized.
    pub fn requires_codec_config(self) -> bool {
        !matches!(self, Self::H263)
    }
}

/// Audio codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    AmrNb,
    AmrWb,
}

impl AudioCodec {
    /// MIME type as carried in source format metadata.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Aac => "audio/mp4a-latm",
            Self::AmrNb => "audio/3gpp",
            Self::AmrWb => "audio/amr-wb",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "audio/mp4a-latm" => Some(Self::Aac),
            "audio/3gpp" => Some(Self::AmrNb),
            "audio/amr-wb" => Some(Self::AmrWb),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aac => "AAC",
            Self::AmrNb => "AMR-NB",
            Self::AmrWb => "AMR-WB",
        }
    }

    /// Sample rate mandated by the codec, if any (the AMR family is fixed).
    pub fn fixed_sample_rate(self) -> Option<u32> {
        match self {
            Self::Aac => None,
            Self::AmrNb => Some(8_000),
            Self::AmrWb => Some(16_000),
        }
    }

    /// Whether the writer must receive an out-of-band configuration blob
    /// (the AudioSpecificConfig for AAC) before the track can be finalized.
    pub fn requires_codec_config(self) -> bool {
        matches!(self, Self::Aac)
    }
}
