//! Low-level MP4 atom/box writing primitives.
//!
//! MP4 files are structured as nested boxes (atoms). Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "ftyp", "moov", "mdat")
//!
//! "Full boxes" additionally have:
//! - 1-byte version
//! - 3-byte flags
//!
//! [`BoxWriter`] tracks a stack of open boxes and patches each size
//! field when the box is closed, so nested structures like `moov` can
//! be emitted without computing sizes up front.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};

use crate::error::{MuxError, MuxResult};

/// Standard video timescale (90kHz, same as MPEG-TS).
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Movie-level timescale (1000 = millisecond precision).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Seconds between the MP4 epoch (1904-01-01) and the Unix epoch
/// (1970-01-01), including leap years.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current wall-clock time as MP4 creation time (seconds since 1904).
pub fn mp4_creation_time() -> u64 {
    let unix_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix_secs + MP4_EPOCH_OFFSET
}

/// Convert a microsecond duration or timestamp to timescale ticks,
/// rounding to the nearest tick.
pub fn us_to_ticks(us: i64, timescale: u32) -> i64 {
    (us * timescale as i64 + 500_000) / 1_000_000
}

/// Duration of a single tick in microseconds, never less than 1.
pub fn tick_duration_us(timescale: u32) -> i64 {
    (1_000_000 / timescale as i64).max(1)
}

/// ISO 639-2/T language code packed into 3x5 bits.
/// Default is "und" (undetermined).
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 {
        // "und" = undetermined
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

/// Write a standard box header: 4-byte size + 4-byte type.
///
/// `size` is the total box size including the 8-byte header.
/// Used for boxes whose size is known up front (`free`, fixed tables);
/// everything nested goes through [`BoxWriter`].
pub fn write_box_header<W: Write>(writer: &mut W, box_type: &[u8; 4], size: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    Ok(())
}

/// Nested box serializer.
///
/// Usage pattern:
/// ```ignore
/// let mut bw = BoxWriter::new(Cursor::new(Vec::new()));
/// bw.begin_box(b"moov")?;
/// bw.begin_full_box(b"mvhd", 0, 0)?;
/// // ... fields ...
/// bw.end_box()?; // mvhd, size patched
/// bw.end_box()?; // moov, size patched
/// let cursor = bw.finish()?;
/// ```
pub struct BoxWriter<W: Write + Seek> {
    writer: W,
    // Positions of the 4-byte size placeholders of open boxes.
    open_boxes: Vec<u64>,
}

impl<W: Write + Seek> BoxWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            open_boxes: Vec::new(),
        }
    }

    /// Open a box: write a size placeholder and the 4-byte type.
    /// Must be balanced by a matching [`end_box`](Self::end_box).
    pub fn begin_box(&mut self, box_type: &[u8; 4]) -> MuxResult<()> {
        let pos = self.writer.stream_position()?;
        self.writer.write_u32::<BigEndian>(0)?; // placeholder
        self.writer.write_all(box_type)?;
        self.open_boxes.push(pos);
        Ok(())
    }

    /// Open a full box: standard header plus 1-byte version and 3-byte flags.
    pub fn begin_full_box(&mut self, box_type: &[u8; 4], version: u8, flags: u32) -> MuxResult<()> {
        self.begin_box(box_type)?;
        let version_flags = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
        self.writer.write_u32::<BigEndian>(version_flags)?;
        Ok(())
    }

    /// Close the innermost open box and patch its size field.
    pub fn end_box(&mut self) -> MuxResult<()> {
        let size_pos = self.open_boxes.pop().ok_or_else(|| {
            MuxError::InvalidState("end_box called with no open box".into())
        })?;
        let current = self.writer.stream_position()?;
        let size = current - size_pos;
        if size > u32::MAX as u64 {
            return Err(MuxError::Malformed(format!(
                "box size {} exceeds 32-bit limit",
                size
            )));
        }
        self.writer.seek(SeekFrom::Start(size_pos))?;
        self.writer.write_u32::<BigEndian>(size as u32)?;
        self.writer.seek(SeekFrom::Start(current))?;
        Ok(())
    }

    /// Consume the writer, returning the underlying stream.
    /// Fails if any box is still open.
    pub fn finish(self) -> MuxResult<W> {
        if !self.open_boxes.is_empty() {
            return Err(MuxError::InvalidState(format!(
                "{} box(es) left open",
                self.open_boxes.len()
            )));
        }
        Ok(self.writer)
    }

    pub fn position(&mut self) -> MuxResult<u64> {
        Ok(self.writer.stream_position()?)
    }

    pub fn write_u8(&mut self, v: u8) -> MuxResult<()> {
        self.writer.write_u8(v)?;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> MuxResult<()> {
        self.writer.write_u16::<BigEndian>(v)?;
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> MuxResult<()> {
        self.writer.write_i16::<BigEndian>(v)?;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> MuxResult<()> {
        self.writer.write_u32::<BigEndian>(v)?;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> MuxResult<()> {
        self.writer.write_i32::<BigEndian>(v)?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> MuxResult<()> {
        self.writer.write_u64::<BigEndian>(v)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> MuxResult<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    pub fn write_fourcc(&mut self, fourcc: &[u8; 4]) -> MuxResult<()> {
        self.writer.write_all(fourcc)?;
        Ok(())
    }

    /// Write zero padding bytes.
    pub fn write_zeros(&mut self, count: usize) -> MuxResult<()> {
        let zeros = vec![0u8; count];
        self.writer.write_all(&zeros)?;
        Ok(())
    }

    /// Write a string truncated or zero-padded to a fixed length.
    pub fn write_fixed_string(&mut self, s: &str, len: usize) -> MuxResult<()> {
        let bytes = s.as_bytes();
        let to_write = bytes.len().min(len);
        self.writer.write_all(&bytes[..to_write])?;
        for _ in to_write..len {
            self.writer.write_u8(0)?;
        }
        Ok(())
    }

    /// Write a fixed-point 16.16 number.
    pub fn write_fixed_16_16(&mut self, value: f64) -> MuxResult<()> {
        let fixed = (value * 65536.0).round() as i32;
        self.writer.write_i32::<BigEndian>(fixed)?;
        Ok(())
    }

    /// Write a fixed-point 8.8 number.
    pub fn write_fixed_8_8(&mut self, value: f64) -> MuxResult<()> {
        let fixed = (value * 256.0).round() as i16;
        self.writer.write_i16::<BigEndian>(fixed)?;
        Ok(())
    }
}
