//! Record values and the on-disk frame codec.
//!
//! # Frame Format
//!
//! Each record is stored as a single frame, little-endian throughout:
//!
//! ```text
//! ┌────────────┬────────────────┬─────────────┬───────────┬──────────┬─────────┐
//! │ Type (1 B) │ Checksum (4 B) │ Length (4 B)│ Index 8 B │ Asqn 8 B │ Payload │
//! └────────────┴────────────────┴─────────────┴───────────┴──────────┴─────────┘
//! ```
//!
//! The type byte is 1 for a record; 0 (or any other value) terminates the
//! readable region of a segment. The checksum is CRC32 of the payload
//! bytes only, and `length` counts the record body (index + asqn +
//! payload). Frames are written marker first, then a zeroed metadata
//! placeholder, then the body; the metadata is back-patched last so a torn
//! write can never look like a complete frame with a matching checksum.
//!
//! The codec never interprets payload bytes.

use crate::error::{JournalError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Asqn value meaning "no application sequence number".
pub const ASQN_IGNORE: i64 = -1;

/// Frame-type marker for a complete record.
pub(crate) const FRAME_RECORD: u8 = 1;

/// Frame-type marker terminating a segment.
pub(crate) const FRAME_EMPTY: u8 = 0;

/// Frame type byte plus record metadata (checksum + length).
pub(crate) const FRAME_HEADER_LEN: usize = 1 + 4 + 4;

/// Fixed part of the record body (index + asqn).
pub(crate) const BODY_FIXED_LEN: usize = 8 + 8;

/// A single journal record.
///
/// The value returned by an append compares equal to the value any reader
/// later returns for the same index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    index: u64,
    asqn: i64,
    checksum: u32,
    data: Vec<u8>,
}

impl JournalRecord {
    /// Create a record, computing the payload checksum.
    #[must_use]
    pub fn new(index: u64, asqn: i64, data: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&data);
        Self {
            index,
            asqn,
            checksum,
            data,
        }
    }

    /// Create a record with a caller-supplied checksum (replication path).
    ///
    /// The checksum is validated against the payload at append time, not
    /// here.
    #[must_use]
    pub fn with_checksum(index: u64, asqn: i64, checksum: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            asqn,
            checksum,
            data,
        }
    }

    /// Journal-assigned position of this record.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Caller-supplied application sequence number, [`ASQN_IGNORE`] if none.
    #[must_use]
    pub fn asqn(&self) -> i64 {
        self.asqn
    }

    /// CRC32 of the payload bytes.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Read-only view of the payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Encoded size of a frame holding `payload_len` payload bytes.
pub(crate) fn frame_length(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + BODY_FIXED_LEN + payload_len
}

/// Outcome of decoding one frame.
#[derive(Debug)]
pub(crate) enum FrameReadOutcome {
    /// A valid record and the number of bytes its frame occupies.
    Record {
        /// Decoded record.
        record: JournalRecord,
        /// Total frame length in bytes.
        length: usize,
    },
    /// The frame-type byte terminates the segment.
    EndOfSegment,
    /// The frame is present but does not validate.
    Corrupt {
        /// What failed to validate.
        cause: String,
    },
}

/// Write one record frame at `pos`.
///
/// Returns the frame length on success, or [`JournalError::SegmentFull`]
/// when the remaining capacity cannot hold the frame.
pub(crate) fn write_frame(
    buf: &mut [u8],
    pos: usize,
    index: u64,
    asqn: i64,
    checksum: u32,
    payload: &[u8],
) -> Result<usize> {
    let length = frame_length(payload.len());
    if pos + length > buf.len() {
        return Err(JournalError::SegmentFull {
            needed: length,
            available: buf.len().saturating_sub(pos),
        });
    }

    buf[pos] = FRAME_RECORD;
    // Metadata placeholder; back-patched below once the body is in place.
    buf[pos + 1..pos + FRAME_HEADER_LEN].fill(0);

    let body = pos + FRAME_HEADER_LEN;
    LittleEndian::write_u64(&mut buf[body..body + 8], index);
    LittleEndian::write_i64(&mut buf[body + 8..body + 16], asqn);
    buf[body + BODY_FIXED_LEN..body + BODY_FIXED_LEN + payload.len()].copy_from_slice(payload);

    LittleEndian::write_u32(&mut buf[pos + 1..pos + 5], checksum);
    LittleEndian::write_u32(
        &mut buf[pos + 5..pos + 9],
        (BODY_FIXED_LEN + payload.len()) as u32,
    );

    Ok(length)
}

/// Decode the frame at `pos`, reading no further than `limit`.
///
/// When `expected_index` is given, a decoded record with a different index
/// is reported as corrupt.
pub(crate) fn read_frame(
    buf: &[u8],
    pos: usize,
    limit: usize,
    expected_index: Option<u64>,
) -> FrameReadOutcome {
    let limit = limit.min(buf.len());
    if pos >= limit {
        return FrameReadOutcome::EndOfSegment;
    }
    if buf[pos] != FRAME_RECORD {
        return FrameReadOutcome::EndOfSegment;
    }
    if pos + FRAME_HEADER_LEN > limit {
        return FrameReadOutcome::Corrupt {
            cause: format!("frame header truncated at position {}", pos),
        };
    }

    let checksum = LittleEndian::read_u32(&buf[pos + 1..pos + 5]);
    let body_len = LittleEndian::read_u32(&buf[pos + 5..pos + 9]) as usize;
    if body_len < BODY_FIXED_LEN {
        return FrameReadOutcome::Corrupt {
            cause: format!("record body length {} below fixed size", body_len),
        };
    }
    if pos + FRAME_HEADER_LEN + body_len > limit {
        return FrameReadOutcome::Corrupt {
            cause: format!(
                "record body of {} bytes at position {} exceeds segment bounds",
                body_len, pos
            ),
        };
    }

    let body = pos + FRAME_HEADER_LEN;
    let index = LittleEndian::read_u64(&buf[body..body + 8]);
    let asqn = LittleEndian::read_i64(&buf[body + 8..body + 16]);
    let payload = &buf[body + BODY_FIXED_LEN..body + body_len];

    let computed = crc32fast::hash(payload);
    if computed != checksum {
        return FrameReadOutcome::Corrupt {
            cause: format!(
                "checksum mismatch for record {}: stored {:#010x}, computed {:#010x}",
                index, checksum, computed
            ),
        };
    }
    if let Some(expected) = expected_index {
        if index != expected {
            return FrameReadOutcome::Corrupt {
                cause: format!("expected record index {}, found {}", expected, index),
            };
        }
    }

    FrameReadOutcome::Record {
        record: JournalRecord::with_checksum(index, asqn, checksum, payload.to_vec()),
        length: FRAME_HEADER_LEN + body_len,
    }
}
