//! Read cursor over one segment.

use super::{Segment, SegmentInner, SegmentState, DESCRIPTOR_LEN};
use crate::error::{JournalError, Result};
use crate::record::{self, FrameReadOutcome, JournalRecord};
use std::sync::Arc;

/// Cursor over one segment's records.
///
/// Any number of readers may coexist with the writer; each reads under
/// the segment's shared lock and is bounded by the writer's current
/// position, so a record becomes visible the moment its append returns.
/// A reader handle itself is not thread-safe.
///
/// Truncation does not touch readers directly. The segment bumps an epoch
/// instead, and a reader that observes a stale epoch re-seeks to its own
/// next index (clamped to the new tail) before serving the call.
pub(crate) struct SegmentReader {
    segment: Segment,
    position: usize,
    next_index: u64,
    epoch: u64,
    closed: bool,
}

impl SegmentReader {
    pub(crate) fn new(segment: Segment, epoch: u64) -> Self {
        let next_index = segment.first_index();
        Self {
            segment,
            position: DESCRIPTOR_LEN,
            next_index,
            epoch,
            closed: false,
        }
    }

    /// The segment this reader is attached to.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Index of the record the next call to [`Self::next`] returns.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Whether a record is available without advancing the cursor.
    pub fn has_next(&mut self) -> Result<bool> {
        let inner = Arc::clone(self.segment.inner());
        let state = inner.state().read();
        self.check_readable(&state)?;
        self.resync(&inner, &state);
        Ok(self.position < state.write_pos())
    }

    /// Decode the record under the cursor and advance past it.
    pub fn next(&mut self) -> Result<JournalRecord> {
        let inner = Arc::clone(self.segment.inner());
        let state = inner.state().read();
        self.check_readable(&state)?;
        self.resync(&inner, &state);

        if self.position >= state.write_pos() {
            return Err(JournalError::IllegalState {
                cause: format!("no record at index {}", self.next_index),
            });
        }

        let mmap = state.mmap().ok_or_else(|| JournalError::IllegalState {
            cause: "segment buffer was unmapped".to_string(),
        })?;
        match record::read_frame(
            &mmap[..],
            self.position,
            state.write_pos(),
            Some(self.next_index),
        ) {
            FrameReadOutcome::Record { record, length } => {
                self.position += length;
                self.next_index += 1;
                Ok(record)
            }
            FrameReadOutcome::EndOfSegment => Err(JournalError::IllegalState {
                cause: format!("no record at index {}", self.next_index),
            }),
            FrameReadOutcome::Corrupt { cause } => Err(JournalError::CorruptedLog { cause }),
        }
    }

    /// Position the cursor at `index`, returning the index of the record
    /// the reader will read next.
    ///
    /// Jumps to the closest sparse-index entry at or below `index`, then
    /// linear-scans. An `index` beyond the segment's range positions the
    /// cursor at the end.
    pub fn seek(&mut self, index: u64) -> Result<u64> {
        let inner = Arc::clone(self.segment.inner());
        let state = inner.state().read();
        self.check_readable(&state)?;

        let (position, next_index) = locate(&inner, &state, index);
        self.position = position;
        self.next_index = next_index;
        self.epoch = state.epoch();
        Ok(self.next_index)
    }

    /// Rewind to the first record of the segment.
    pub fn reset(&mut self) -> Result<u64> {
        self.seek(self.segment.first_index())
    }

    /// Detach from the segment; may trigger the deferred deletion of a
    /// segment already marked for deletion.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.segment.on_reader_closed();
        }
    }

    fn check_readable(&self, state: &SegmentState) -> Result<()> {
        if self.closed {
            return Err(JournalError::IllegalState {
                cause: "reader is closed".to_string(),
            });
        }
        if state.is_marked_for_deletion() {
            return Err(JournalError::SegmentDeleted {
                segment_id: self.segment.id(),
            });
        }
        if !state.is_readable() {
            return Err(JournalError::IllegalState {
                cause: format!("segment {} is closed", self.segment.id()),
            });
        }
        Ok(())
    }

    fn resync(&mut self, inner: &SegmentInner, state: &SegmentState) {
        if state.epoch() != self.epoch {
            let (position, next_index) = locate(inner, state, self.next_index);
            self.position = position;
            self.next_index = next_index;
            self.epoch = state.epoch();
        }
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Byte position and index of the record closest to `target` from below,
/// clamped to the segment's readable range.
fn locate(inner: &SegmentInner, state: &SegmentState, target: u64) -> (usize, u64) {
    let descriptor = inner.descriptor();
    let target = target.max(descriptor.index());

    let mut position = DESCRIPTOR_LEN;
    let mut next_index = descriptor.index();

    if let Some(entry) = inner.index().lookup(target) {
        if entry.segment_id == descriptor.id()
            && entry.index >= descriptor.index()
            && (entry.position as usize) < state.write_pos()
        {
            position = entry.position as usize;
            next_index = entry.index;
        }
    }

    let Some(mmap) = state.mmap() else {
        return (position, next_index);
    };
    while next_index < target && position < state.write_pos() {
        match record::read_frame(&mmap[..], position, state.write_pos(), Some(next_index)) {
            FrameReadOutcome::Record { length, .. } => {
                position += length;
                next_index += 1;
            }
            _ => break,
        }
    }
    (position, next_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SparseIndex;
    use crate::segment::{SegmentDescriptor, SegmentFile};
    use tempfile::tempdir;

    fn populated_segment(dir: &std::path::Path, records: u64) -> Segment {
        let segment = Segment::create(
            SegmentFile::new(dir, "journal", 1),
            SegmentDescriptor::new(1, 1, 64 * 1024),
            Arc::new(SparseIndex::new(2)),
            false,
        )
        .unwrap();
        let writer = segment.writer();
        for i in 1..=records {
            writer.append(i as i64, format!("payload-{}", i).as_bytes()).unwrap();
        }
        segment
    }

    #[test]
    fn reads_records_in_order() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 3);
        let mut reader = segment.create_reader().unwrap();

        for i in 1..=3u64 {
            assert!(reader.has_next().unwrap());
            let record = reader.next().unwrap();
            assert_eq!(record.index(), i);
            assert_eq!(record.asqn(), i as i64);
            assert_eq!(record.data(), format!("payload-{}", i).as_bytes());
            assert_eq!(record.checksum(), crc32fast::hash(record.data()));
        }
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn observes_appends_made_after_creation() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 0);
        let mut reader = segment.create_reader().unwrap();
        assert!(!reader.has_next().unwrap());

        let appended = segment.writer().append(1, b"late").unwrap();

        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next().unwrap(), appended);
    }

    #[test]
    fn seek_jumps_via_sparse_index() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 10);
        let mut reader = segment.create_reader().unwrap();

        assert_eq!(reader.seek(7).unwrap(), 7);
        assert_eq!(reader.next().unwrap().index(), 7);

        // Below range clamps to the first record.
        assert_eq!(reader.seek(0).unwrap(), 1);
        // Beyond range positions at the end.
        assert_eq!(reader.seek(42).unwrap(), 11);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn resyncs_after_truncation() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 5);
        let writer = segment.writer();
        let mut reader = segment.create_reader().unwrap();
        for _ in 0..5 {
            reader.next().unwrap();
        }

        writer.truncate(3).unwrap();
        assert!(!reader.has_next().unwrap());

        // New appends continue at index 4 and the reader picks them up.
        let replacement = writer.append(99, b"rewritten").unwrap();
        assert_eq!(replacement.index(), 4);
        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next().unwrap(), replacement);
    }

    #[test]
    fn fails_once_segment_is_deleted() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 1);
        let mut reader = segment.create_reader().unwrap();

        segment.delete().unwrap();

        assert!(matches!(
            reader.next(),
            Err(JournalError::SegmentDeleted { segment_id: 1 })
        ));
    }

    #[test]
    fn reset_rewinds_to_segment_start() {
        let dir = tempdir().unwrap();
        let segment = populated_segment(dir.path(), 2);
        let mut reader = segment.create_reader().unwrap();
        reader.next().unwrap();
        reader.next().unwrap();

        assert_eq!(reader.reset().unwrap(), 1);
        assert_eq!(reader.next().unwrap().index(), 1);
    }
}
