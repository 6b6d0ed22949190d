//! Single-writer append path of one segment.

use super::{Segment, DESCRIPTOR_LEN};
use crate::error::{JournalError, Result};
use crate::record::{self, FrameReadOutcome, JournalRecord, FRAME_EMPTY};
use tracing::debug;

/// Append handle owning the rightmost cursor of one segment.
///
/// Exactly one writer is active per journal; the journal moves it to the
/// next segment on rollover. All mutating calls are serialised by the
/// caller per the journal's concurrency contract.
pub(crate) struct SegmentWriter {
    segment: Segment,
}

impl SegmentWriter {
    pub(crate) fn new(segment: Segment) -> Self {
        Self { segment }
    }

    /// Append a new record, assigning the segment's next index.
    ///
    /// Fails with [`JournalError::SegmentFull`] when the encoded frame
    /// does not fit in the remaining capacity; the journal handles that by
    /// rolling over.
    pub fn append(&self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
        let checksum = crc32fast::hash(data);
        self.append_frame(asqn, checksum, data)
    }

    /// Append a caller-supplied record (replication path).
    ///
    /// The record must continue the log exactly and carry the checksum of
    /// its own payload.
    pub fn append_record(&self, record: &JournalRecord) -> Result<JournalRecord> {
        let expected = self.segment.next_index();
        if record.index() != expected {
            return Err(JournalError::InvalidIndex {
                index: record.index(),
                expected,
            });
        }
        let computed = crc32fast::hash(record.data());
        if computed != record.checksum() {
            return Err(JournalError::InvalidChecksum {
                expected: computed,
                actual: record.checksum(),
            });
        }
        self.append_frame(record.asqn(), record.checksum(), record.data())
    }

    fn append_frame(&self, asqn: i64, checksum: u32, data: &[u8]) -> Result<JournalRecord> {
        let inner = self.segment.inner();
        let descriptor = inner.descriptor();
        let mut state = inner.state().write();

        if !state.is_writable() {
            return Err(JournalError::IllegalState {
                cause: format!("cannot append to segment {}: segment is not open", descriptor.id()),
            });
        }

        let index = state.next_index();
        let pos = state.write_pos();
        let capacity = descriptor.max_segment_size() as usize;

        let length = {
            let mmap = state.mmap_mut().ok_or_else(|| JournalError::IllegalState {
                cause: "segment buffer was unmapped".to_string(),
            })?;
            let length = record::write_frame(&mut mmap[..capacity], pos, index, asqn, checksum, data)?;
            // Terminate the segment after the new frame so a crash between
            // this append and the next leaves a clean end-of-segment
            // marker instead of residual bytes from a truncated past.
            if pos + length < capacity {
                mmap[pos + length] = FRAME_EMPTY;
            }
            if inner.flush_explicitly() {
                let flush_len = (length + 1).min(capacity - pos);
                mmap.flush_range(pos, flush_len)
                    .map_err(|e| JournalError::Io {
                        path: inner.file().path(),
                        cause: e.to_string(),
                    })?;
            }
            length
        };

        inner.index().index_record(
            index,
            pos as u32,
            descriptor.id(),
            index == descriptor.index(),
        );
        state.set_write_pos(pos + length);
        state.set_next_index(index + 1);

        Ok(JournalRecord::with_checksum(
            index,
            asqn,
            checksum,
            data.to_vec(),
        ))
    }

    /// Truncate the segment so `index` is its last record.
    ///
    /// Positions the cursor at the byte following that record's frame (or
    /// at the start of the segment when `index` lies below it), writes the
    /// end-of-segment marker there, and drops sparse-index entries above
    /// `index`. Readers that ran ahead re-synchronise on their next call.
    pub fn truncate(&self, index: u64) -> Result<()> {
        let inner = self.segment.inner();
        let descriptor = inner.descriptor();
        let mut state = inner.state().write();

        if !state.is_writable() {
            return Err(JournalError::IllegalState {
                cause: format!(
                    "cannot truncate segment {}: segment is not open",
                    descriptor.id()
                ),
            });
        }
        if index >= state.next_index() - 1 {
            return Ok(());
        }

        let capacity = descriptor.max_segment_size() as usize;
        let (mut pos, mut next_index) = (DESCRIPTOR_LEN, descriptor.index());
        if index >= descriptor.index() {
            let limit = state.write_pos();
            let mmap = state.mmap().ok_or_else(|| JournalError::IllegalState {
                cause: "segment buffer was unmapped".to_string(),
            })?;
            while next_index <= index {
                match record::read_frame(&mmap[..capacity], pos, limit, Some(next_index)) {
                    FrameReadOutcome::Record { length, .. } => {
                        pos += length;
                        next_index += 1;
                    }
                    // The region below the cursor was validated at append
                    // or recovery time, so this cannot be reached for a
                    // threshold within the segment.
                    _ => break,
                }
            }
        }

        {
            let mmap = state.mmap_mut().ok_or_else(|| JournalError::IllegalState {
                cause: "segment buffer was unmapped".to_string(),
            })?;
            if pos < capacity {
                mmap[pos] = FRAME_EMPTY;
                if inner.flush_explicitly() {
                    mmap.flush_range(pos, 1).map_err(|e| JournalError::Io {
                        path: inner.file().path(),
                        cause: e.to_string(),
                    })?;
                }
            }
        }

        inner.index().delete_after(index);
        state.set_write_pos(pos);
        state.set_next_index(next_index);
        state.bump_epoch();
        debug!(
            segment_id = descriptor.id(),
            last_index = index,
            "truncated segment"
        );
        Ok(())
    }

    /// Rewind the segment to empty, with `next_index` as the index of the
    /// next record.
    pub fn reset(&self, next_index: u64) -> Result<()> {
        let inner = self.segment.inner();
        let mut state = inner.state().write();
        if !state.is_writable() {
            return Err(JournalError::IllegalState {
                cause: format!(
                    "cannot reset segment {}: segment is not open",
                    inner.descriptor().id()
                ),
            });
        }

        {
            let mmap = state.mmap_mut().ok_or_else(|| JournalError::IllegalState {
                cause: "segment buffer was unmapped".to_string(),
            })?;
            mmap[DESCRIPTOR_LEN] = FRAME_EMPTY;
        }
        state.set_write_pos(DESCRIPTOR_LEN);
        state.set_next_index(next_index);
        state.bump_epoch();
        Ok(())
    }

    /// Index of the last appended record; `first_index - 1` when empty.
    pub fn last_index(&self) -> u64 {
        self.segment.last_index()
    }

    /// Index the next appended record receives.
    pub fn next_index(&self) -> u64 {
        self.segment.next_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SparseIndex;
    use crate::record::ASQN_IGNORE;
    use crate::segment::{SegmentDescriptor, SegmentFile};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn segment_with_index(
        dir: &std::path::Path,
        capacity: u32,
        density: u64,
    ) -> (Segment, Arc<SparseIndex>) {
        let index = Arc::new(SparseIndex::new(density));
        let segment = Segment::create(
            SegmentFile::new(dir, "journal", 1),
            SegmentDescriptor::new(1, 1, capacity),
            Arc::clone(&index),
            false,
        )
        .unwrap();
        (segment, index)
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let dir = tempdir().unwrap();
        let (segment, _) = segment_with_index(dir.path(), 4096, 1);
        let writer = segment.writer();

        let first = writer.append(10, b"a").unwrap();
        let second = writer.append(20, b"b").unwrap();

        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 2);
        assert_eq!(first.asqn(), 10);
        assert_eq!(writer.last_index(), 2);
        assert_eq!(writer.next_index(), 3);
    }

    #[test]
    fn append_updates_sparse_index_at_density_boundaries() {
        let dir = tempdir().unwrap();
        let (segment, index) = segment_with_index(dir.path(), 8192, 2);
        let writer = segment.writer();

        for i in 0..5 {
            writer.append(i, b"data").unwrap();
        }

        // 1 (first of segment), 2 and 4 (density boundaries).
        assert_eq!(index.lookup(1).unwrap().index, 1);
        assert_eq!(index.lookup(3).unwrap().index, 2);
        assert_eq!(index.lookup(5).unwrap().index, 4);
    }

    #[test]
    fn append_fails_with_segment_full() {
        let dir = tempdir().unwrap();
        let payload = b"test";
        let capacity = (DESCRIPTOR_LEN + record::frame_length(payload.len())) as u32;
        let (segment, _) = segment_with_index(dir.path(), capacity, 1);
        let writer = segment.writer();

        writer.append(1, payload).unwrap();
        let err = writer.append(2, payload).unwrap_err();
        assert!(err.is_segment_full());
    }

    #[test]
    fn append_record_validates_index_and_checksum() {
        let dir = tempdir().unwrap();
        let (segment, _) = segment_with_index(dir.path(), 4096, 1);
        let writer = segment.writer();
        writer.append(1, b"one").unwrap();

        let stale = JournalRecord::new(1, 2, b"two".to_vec());
        assert!(matches!(
            writer.append_record(&stale),
            Err(JournalError::InvalidIndex { expected: 2, .. })
        ));

        let bad_checksum = JournalRecord::with_checksum(2, 2, 0xDEAD_BEEF, b"two".to_vec());
        assert!(matches!(
            writer.append_record(&bad_checksum),
            Err(JournalError::InvalidChecksum { .. })
        ));

        let good = JournalRecord::new(2, 2, b"two".to_vec());
        let appended = writer.append_record(&good).unwrap();
        assert_eq!(appended, good);
    }

    #[test]
    fn truncate_rewinds_to_the_given_index() {
        let dir = tempdir().unwrap();
        let (segment, index) = segment_with_index(dir.path(), 4096, 1);
        let writer = segment.writer();
        for i in 1..=3 {
            writer.append(i, b"data").unwrap();
        }

        writer.truncate(1).unwrap();

        assert_eq!(writer.last_index(), 1);
        assert_eq!(index.lookup(3).unwrap().index, 1);

        let replacement = writer.append(ASQN_IGNORE, b"new").unwrap();
        assert_eq!(replacement.index(), 2);
    }

    #[test]
    fn truncate_below_segment_start_empties_it() {
        let dir = tempdir().unwrap();
        let (segment, _) = segment_with_index(dir.path(), 4096, 1);
        let writer = segment.writer();
        writer.append(1, b"data").unwrap();

        writer.truncate(0).unwrap();

        assert!(segment.is_empty());
        assert_eq!(writer.last_index(), 0);
    }

    #[test]
    fn reset_moves_the_next_index() {
        let dir = tempdir().unwrap();
        let (segment, _) = segment_with_index(dir.path(), 4096, 1);
        let writer = segment.writer();
        writer.append(1, b"data").unwrap();

        writer.reset(100).unwrap();

        assert!(segment.is_empty());
        assert_eq!(writer.next_index(), 100);
    }
}
