//! AVC (H.264) NAL unit handling for MP4 storage.
//!
//! Encoders hand over parameter sets and frames in Annex-B byte-stream
//! form (NAL units delimited by start codes). MP4 stores frames with
//! big-endian length prefixes instead, and keeps the parameter sets in
//! an AVCDecoderConfigurationRecord inside the avcC box. This module
//! converts between the two.

use crate::error::{MuxError, MuxResult};

/// Annex-B start code delimiting NAL units.
const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// High, High-10, High-4:2:2 and High-4:4:4 profile IDs.
const REJECTED_PROFILES: [u8; 4] = [100, 110, 122, 144];

fn nal_type(unit: &[u8]) -> u8 {
    unit[0] & 0x1F
}

/// Parsed AVC parameter sets, ready to be assembled into an
/// AVCDecoderConfigurationRecord.
#[derive(Clone, Debug)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfig {
    /// Parse an Annex-B codec config: one or more SPS units followed by
    /// one or more PPS units, each introduced by a 4-byte start code.
    pub fn parse_annexb(data: &[u8]) -> MuxResult<Self> {
        if data.len() < 4 || data[..4] != START_CODE {
            return Err(MuxError::Malformed(
                "AVC codec config must begin with a 4-byte start code".into(),
            ));
        }

        let mut sps: Vec<Vec<u8>> = Vec::new();
        let mut pps: Vec<Vec<u8>> = Vec::new();

        for unit in split_annexb(data) {
            if unit.is_empty() {
                return Err(MuxError::Malformed("empty NAL unit in codec config".into()));
            }
            if unit.len() > u16::MAX as usize {
                return Err(MuxError::Malformed(format!(
                    "parameter set of {} bytes does not fit a 2-byte length",
                    unit.len()
                )));
            }
            match nal_type(unit) {
                NAL_TYPE_SPS => {
                    if !pps.is_empty() {
                        return Err(MuxError::Malformed(
                            "SPS after PPS in codec config".into(),
                        ));
                    }
                    if unit.len() < 4 {
                        return Err(MuxError::Malformed("truncated SPS".into()));
                    }
                    if REJECTED_PROFILES.contains(&unit[1]) {
                        return Err(MuxError::UnsupportedCodec(format!(
                            "AVC profile {} requires record extensions",
                            unit[1]
                        )));
                    }
                    sps.push(unit.to_vec());
                }
                NAL_TYPE_PPS => {
                    if sps.is_empty() {
                        return Err(MuxError::Malformed(
                            "PPS before SPS in codec config".into(),
                        ));
                    }
                    pps.push(unit.to_vec());
                }
                other => {
                    return Err(MuxError::Malformed(format!(
                        "unexpected NAL type {} in codec config",
                        other
                    )));
                }
            }
        }

        if sps.is_empty() || pps.is_empty() {
            return Err(MuxError::Malformed(
                "codec config needs at least one SPS and one PPS".into(),
            ));
        }
        // 5-bit and 8-bit count fields in the record.
        if sps.len() > 31 || pps.len() > 255 {
            return Err(MuxError::Malformed(format!(
                "too many parameter sets: {} SPS, {} PPS",
                sps.len(),
                pps.len()
            )));
        }

        let first = &sps[0];
        Ok(Self {
            profile: first[1],
            compatibility: first[2],
            level: first[3],
            sps,
            pps,
        })
    }

    /// Assemble the AVCDecoderConfigurationRecord (avcC box payload).
    pub fn to_record(&self, four_byte_lengths: bool) -> Vec<u8> {
        let mut record = Vec::with_capacity(
            7 + self.sps.iter().map(|s| s.len() + 2).sum::<usize>()
                + self.pps.iter().map(|p| p.len() + 2).sum::<usize>(),
        );
        record.push(1); // configurationVersion
        record.push(self.profile);
        record.push(self.compatibility);
        record.push(self.level);
        let length_size: u8 = if four_byte_lengths { 4 } else { 2 };
        record.push(0xFC | (length_size - 1)); // lengthSizeMinusOne | reserved
        record.push(0xE0 | self.sps.len() as u8); // numOfSequenceParameterSets | reserved
        for sps in &self.sps {
            record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            record.extend_from_slice(sps);
        }
        record.push(self.pps.len() as u8);
        for pps in &self.pps {
            record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            record.extend_from_slice(pps);
        }
        record
    }
}

/// Build the avcC record from source codec config, which may be either
/// Annex-B parameter sets or an already-assembled record (first byte 1).
pub fn build_avc_record(data: &[u8], four_byte_lengths: bool) -> MuxResult<Vec<u8>> {
    if data.first() == Some(&1) {
        // Pre-built record: used verbatim.
        if data.len() < 7 {
            return Err(MuxError::Malformed(format!(
                "AVC config record too short: {} bytes",
                data.len()
            )));
        }
        let record_length_size = (data[4] & 0x03) + 1;
        let configured = if four_byte_lengths { 4 } else { 2 };
        if record_length_size != configured {
            tracing::warn!(
                record_length_size,
                configured,
                "AVC record NAL length size differs from writer config"
            );
        }
        return Ok(data.to_vec());
    }
    Ok(AvcConfig::parse_annexb(data)?.to_record(four_byte_lengths))
}

/// Iterate NAL unit payloads in an Annex-B buffer that begins with a
/// start code.
fn split_annexb(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = &data[4..];
    let mut units = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 4 <= body.len() {
        if body[i..i + 4] == START_CODE {
            units.push(&body[start..i]);
            start = i + 4;
            i += 4;
        } else {
            i += 1;
        }
    }
    units.push(&body[start..]);
    units.into_iter()
}

/// Strip a leading 4-byte start code if present.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.len() >= 4 && data[..4] == START_CODE {
        &data[4..]
    } else {
        data
    }
}

/// Convert an Annex-B sample to MP4 framing: strip the leading start
/// code and prepend a big-endian length. The recorded sample size
/// includes the prefix bytes.
pub fn length_prefixed(data: &[u8], four_byte_lengths: bool) -> MuxResult<Vec<u8>> {
    let payload = strip_start_code(data);
    let mut out = Vec::with_capacity(payload.len() + 4);
    if four_byte_lengths {
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    } else {
        if payload.len() > u16::MAX as usize {
            return Err(MuxError::Malformed(format!(
                "NAL unit of {} bytes does not fit a 2-byte length prefix",
                payload.len()
            )));
        }
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(payload);
    Ok(out)
}
