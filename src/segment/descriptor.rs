//! Segment file descriptor.
//!
//! The descriptor is a fixed 32-byte header at offset 0 of every segment
//! file. Its own CRC32 guards the remaining bytes, so a half-written or
//! bit-rotted header is distinguishable from a valid one:
//!
//! ```text
//! ┌───────────────┬──────────────┬─────────┬────────────┬───────────────┬──────────┐
//! │ Checksum (4B) │ Version (1B) │ Id (8B) │ Index (8B) │ Max size (4B) │ Reserved │
//! └───────────────┴──────────────┴─────────┴────────────┴───────────────┴──────────┘
//! ```
//!
//! `id` is monotone across segments; `index` is the first record index the
//! segment may hold; `max_segment_size` is the mapped capacity, descriptor
//! included. Little-endian throughout.

use byteorder::{ByteOrder, LittleEndian};

/// Current descriptor format version.
const DESCRIPTOR_VERSION: u8 = 1;

/// Fixed encoded length of the descriptor in bytes.
pub(crate) const DESCRIPTOR_LEN: usize = 32;

/// Self-describing header at the start of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentDescriptor {
    id: u64,
    index: u64,
    max_segment_size: u32,
}

/// Outcome of decoding a descriptor region.
#[derive(Debug)]
pub(crate) enum DescriptorReadOutcome {
    /// Checksum and version validate.
    Valid(SegmentDescriptor),
    /// The region is all zeroes: the file was created but never
    /// initialised.
    PartiallyWritten,
    /// The region holds data that fails validation.
    Invalid,
}

impl SegmentDescriptor {
    /// Create a descriptor for a new segment.
    pub fn new(id: u64, index: u64, max_segment_size: u32) -> Self {
        Self {
            id,
            index,
            max_segment_size,
        }
    }

    /// Monotone segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// First record index this segment may hold.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Mapped capacity of the segment, descriptor included.
    pub fn max_segment_size(&self) -> u32 {
        self.max_segment_size
    }

    /// Encode into the first [`DESCRIPTOR_LEN`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= DESCRIPTOR_LEN);
        buf[..DESCRIPTOR_LEN].fill(0);
        buf[4] = DESCRIPTOR_VERSION;
        LittleEndian::write_u64(&mut buf[5..13], self.id);
        LittleEndian::write_u64(&mut buf[13..21], self.index);
        LittleEndian::write_u32(&mut buf[21..25], self.max_segment_size);

        let checksum = crc32fast::hash(&buf[4..DESCRIPTOR_LEN]);
        LittleEndian::write_u32(&mut buf[..4], checksum);
    }

    /// Decode the descriptor region, classifying the three open-time cases.
    pub fn decode(buf: &[u8]) -> DescriptorReadOutcome {
        if buf.len() < DESCRIPTOR_LEN {
            return DescriptorReadOutcome::PartiallyWritten;
        }
        if buf[..DESCRIPTOR_LEN].iter().all(|&b| b == 0) {
            return DescriptorReadOutcome::PartiallyWritten;
        }

        let stored = LittleEndian::read_u32(&buf[..4]);
        let computed = crc32fast::hash(&buf[4..DESCRIPTOR_LEN]);
        if stored != computed || buf[4] != DESCRIPTOR_VERSION {
            return DescriptorReadOutcome::Invalid;
        }

        DescriptorReadOutcome::Valid(Self {
            id: LittleEndian::read_u64(&buf[5..13]),
            index: LittleEndian::read_u64(&buf[13..21]),
            max_segment_size: LittleEndian::read_u32(&buf[21..25]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let descriptor = SegmentDescriptor::new(3, 250, 1024 * 1024);
        let mut buf = [0u8; DESCRIPTOR_LEN];
        descriptor.encode(&mut buf);

        match SegmentDescriptor::decode(&buf) {
            DescriptorReadOutcome::Valid(decoded) => assert_eq!(decoded, descriptor),
            other => panic!("expected valid descriptor, got {:?}", other),
        }
    }

    #[test]
    fn zeroed_region_is_partially_written() {
        let buf = [0u8; DESCRIPTOR_LEN];
        assert!(matches!(
            SegmentDescriptor::decode(&buf),
            DescriptorReadOutcome::PartiallyWritten
        ));
    }

    #[test]
    fn short_region_is_partially_written() {
        let buf = [0u8; 7];
        assert!(matches!(
            SegmentDescriptor::decode(&buf),
            DescriptorReadOutcome::PartiallyWritten
        ));
    }

    #[test]
    fn flipped_byte_is_invalid() {
        let descriptor = SegmentDescriptor::new(1, 1, 4096);
        let mut buf = [0u8; DESCRIPTOR_LEN];
        descriptor.encode(&mut buf);
        buf[13] ^= 0xFF;

        assert!(matches!(
            SegmentDescriptor::decode(&buf),
            DescriptorReadOutcome::Invalid
        ));
    }

    #[test]
    fn corrupted_checksum_is_invalid() {
        let descriptor = SegmentDescriptor::new(1, 1, 4096);
        let mut buf = [0u8; DESCRIPTOR_LEN];
        descriptor.encode(&mut buf);
        buf[0] ^= 0x01;

        assert!(matches!(
            SegmentDescriptor::decode(&buf),
            DescriptorReadOutcome::Invalid
        ));
    }
}
