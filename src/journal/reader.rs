//! Journal-wide reader.

use super::JournalShared;
use crate::error::{JournalError, Result};
use crate::record::JournalRecord;
use crate::segment::{Segment, SegmentReader};
use std::sync::Arc;

/// Forward iterator over the whole journal.
///
/// Holds one segment reader at a time and advances to the next segment
/// transparently when the current one is exhausted — a lazy sequence of
/// records, restartable via [`Self::seek`].
///
/// The reader tolerates the journal changing under it: after a tail
/// truncation it re-synchronises to the new tail, and when its segment is
/// compacted away it re-routes to the segment now containing its next
/// index (or to the new head). Only [`super::SegmentedJournal::reset`]
/// and [`super::SegmentedJournal::close`] invalidate the reader for good.
pub struct JournalReader {
    shared: Arc<JournalShared>,
    /// Journal reset epoch this reader was created under.
    epoch: u64,
    current: SegmentReader,
    closed: bool,
}

impl JournalReader {
    pub(crate) fn new(shared: Arc<JournalShared>, first: Segment, epoch: u64) -> Result<Self> {
        let current = first.create_reader()?;
        Ok(Self {
            shared,
            epoch,
            current,
            closed: false,
        })
    }

    /// Whether a record is available without advancing.
    pub fn has_next(&mut self) -> Result<bool> {
        self.revalidate()?;
        loop {
            if self.current.has_next()? {
                return Ok(true);
            }
            if !self.advance_segment()? {
                return Ok(false);
            }
        }
    }

    /// Return the record under the cursor and advance past it.
    ///
    /// Fails with [`JournalError::IllegalState`] when no record is
    /// available; call [`Self::has_next`] first.
    pub fn next(&mut self) -> Result<JournalRecord> {
        if !self.has_next()? {
            return Err(JournalError::IllegalState {
                cause: format!("no record at index {}", self.current.next_index()),
            });
        }
        self.current.next()
    }

    /// Position the reader so the next record returned carries `index`,
    /// clamped to the journal's range; returns the index the reader
    /// actually points at.
    pub fn seek(&mut self, index: u64) -> Result<u64> {
        self.check_usable()?;

        let inner = self.shared.inner.read();
        let target = index
            .max(inner.first_index())
            .min(inner.last_index() + 1);
        let segment = inner
            .segments
            .range(..=target)
            .next_back()
            .map(|(_, s)| s.clone())
            .ok_or_else(|| JournalError::IllegalState {
                cause: "journal is closed".to_string(),
            })?;
        drop(inner);

        if segment.id() != self.current.segment().id() || !self.current.segment().is_alive() {
            let reader = segment.create_reader()?;
            self.current.close();
            self.current = reader;
        }
        self.current.seek(target)
    }

    /// Release the reader; may trigger deferred deletion of its segment.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.current.close();
        }
    }

    /// Move to the segment starting at the reader's next index, if any.
    fn advance_segment(&mut self) -> Result<bool> {
        let next_index = self.current.next_index();
        let inner = self.shared.inner.read();
        let Some(segment) = inner.segments.get(&next_index) else {
            return Ok(false);
        };
        if segment.id() == self.current.segment().id() {
            return Ok(false);
        }
        let segment = segment.clone();
        drop(inner);

        let reader = segment.create_reader()?;
        self.current.close();
        self.current = reader;
        Ok(true)
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(JournalError::IllegalState {
                cause: "reader is closed".to_string(),
            });
        }
        let inner = self.shared.inner.read();
        if !inner.open {
            return Err(JournalError::IllegalState {
                cause: "journal is closed".to_string(),
            });
        }
        if inner.reset_epoch != self.epoch {
            return Err(JournalError::IllegalState {
                cause: "journal was reset while this reader was open".to_string(),
            });
        }
        Ok(())
    }

    /// Fail on closed/reset journals, re-route when the current segment
    /// went away through truncation or compaction.
    fn revalidate(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.current.segment().is_alive() {
            return Ok(());
        }

        let inner = self.shared.inner.read();
        let target = self.current.next_index().max(inner.first_index());
        let segment = inner
            .segments
            .range(..=target)
            .next_back()
            .map(|(_, s)| s.clone())
            .ok_or_else(|| JournalError::IllegalState {
                cause: "journal is closed".to_string(),
            })?;
        drop(inner);

        let mut reader = segment.create_reader()?;
        reader.seek(target)?;
        self.current.close();
        self.current = reader;
        Ok(())
    }
}

impl Drop for JournalReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalConfig, SegmentedJournal};
    use crate::record::{self, ASQN_IGNORE};
    use crate::segment::DESCRIPTOR_LEN;
    use tempfile::{tempdir, TempDir};

    fn config(dir: &TempDir) -> JournalConfig {
        JournalConfig::default()
            .with_directory(dir.path().join("data"))
            .with_index_density(1)
            .with_flush_explicitly(false)
    }

    /// Journal sized to `entries` "test"-sized records per segment.
    fn open_sized(dir: &TempDir, entries: u32) -> SegmentedJournal {
        let size = DESCRIPTOR_LEN as u32 + record::frame_length(4) as u32 * entries;
        SegmentedJournal::open(config(dir).with_max_segment_size(size)).unwrap()
    }

    #[test]
    fn reads_across_segment_boundaries() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 2);
        let mut appended = Vec::new();
        for i in 1..=6 {
            appended.push(journal.append(i, b"test").unwrap());
        }

        let mut reader = journal.open_reader().unwrap();
        for expected in &appended {
            assert!(reader.has_next().unwrap());
            assert_eq!(&reader.next().unwrap(), expected);
        }
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn existing_reader_observes_new_appends() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 2);
        let mut reader = journal.open_reader().unwrap();
        assert!(!reader.has_next().unwrap());

        for i in 1..=4u64 {
            let appended = journal.append(i as i64 + 9, b"test").unwrap();
            assert!(reader.has_next().unwrap());
            let read = reader.next().unwrap();
            assert_eq!(read, appended);
            assert_eq!(read.index(), i);
        }
    }

    #[test]
    fn seek_lands_on_the_requested_index() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 2);
        for i in 1..=6 {
            journal.append(i, b"test").unwrap();
        }
        let mut reader = journal.open_reader().unwrap();

        assert_eq!(reader.seek(5).unwrap(), 5);
        assert_eq!(reader.next().unwrap().index(), 5);

        // Backwards across a segment boundary.
        assert_eq!(reader.seek(2).unwrap(), 2);
        assert_eq!(reader.next().unwrap().index(), 2);
    }

    #[test]
    fn seek_clamps_to_the_journal_range() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 2);
        for i in 1..=4 {
            journal.append(i, b"test").unwrap();
        }
        journal.delete_until(4).unwrap();
        let mut reader = journal.open_reader().unwrap();

        // Below the head clamps to the first remaining record.
        assert_eq!(reader.seek(1).unwrap(), 3);
        // Beyond the tail clamps to one past the end.
        assert_eq!(reader.seek(99).unwrap(), 5);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn reader_consumed_up_to_truncation_point_continues_with_new_records() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        let mut written = Vec::new();
        let mut reader = journal.open_reader().unwrap();
        for i in 1..=10 {
            written.push(journal.append(i, b"test").unwrap());
        }
        for expected in written.iter().take(5) {
            assert_eq!(&reader.next().unwrap(), expected);
        }

        journal.delete_after(5).unwrap();
        for i in 6..=10 {
            written[i - 1] = journal.append(i as i64, b"test").unwrap();
        }

        for expected in written.iter().skip(5) {
            assert!(reader.has_next().unwrap());
            assert_eq!(&reader.next().unwrap(), expected);
        }
    }

    #[test]
    fn reader_past_truncation_point_sees_end_of_log() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        let mut reader = journal.open_reader().unwrap();
        journal.append(1, b"test").unwrap();
        journal.append(2, b"test").unwrap();
        journal.append(3, b"test").unwrap();
        reader.next().unwrap();
        reader.next().unwrap();
        assert!(reader.has_next().unwrap());

        journal.delete_after(1).unwrap();

        assert_eq!(journal.last_index(), 1);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn reader_in_truncated_segment_rejoins_the_log() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 1);
        let first = journal.append(1, b"test").unwrap();
        journal.append(2, b"test").unwrap();
        let mut reader = journal.open_reader().unwrap();
        assert_eq!(reader.next().unwrap(), first);
        assert_eq!(reader.next().unwrap().index(), 2);

        // The reader's segment is deleted by the truncation.
        journal.delete_after(first.index()).unwrap();
        assert!(!reader.has_next().unwrap());

        let replacement = journal.append(9, b"test").unwrap();
        assert_eq!(replacement.index(), 2);
        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next().unwrap(), replacement);
    }

    #[test]
    fn compaction_moves_stale_readers_to_the_new_head() {
        let dir = tempdir().unwrap();
        let journal = open_sized(&dir, 2);
        let mut reader = journal.open_reader().unwrap();
        let mut last = 0;
        for i in 1..=4 {
            last = journal.append(i, b"test").unwrap().index();
        }
        assert!(reader.has_next().unwrap());

        journal.delete_until(last).unwrap();

        assert_eq!(journal.first_index(), last - 1);
        assert_eq!(reader.next().unwrap().index(), last - 1);
        assert_eq!(reader.next().unwrap().index(), last);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn reset_invalidates_outstanding_readers() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        let mut reader = journal.open_reader().unwrap();
        journal.append(1, b"test").unwrap();
        journal.append(2, b"test").unwrap();
        assert_eq!(reader.next().unwrap().index(), 1);

        journal.reset(2).unwrap();
        assert_eq!(journal.append(3, b"test").unwrap().index(), 2);

        assert!(matches!(
            reader.has_next(),
            Err(JournalError::IllegalState { .. })
        ));
        assert!(matches!(
            reader.next(),
            Err(JournalError::IllegalState { .. })
        ));

        // A reader opened after the reset works.
        let mut fresh = journal.open_reader().unwrap();
        assert_eq!(fresh.next().unwrap().index(), 2);
    }

    #[test]
    fn closed_reader_and_closed_journal_fail() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        journal.append(1, b"test").unwrap();

        let mut reader = journal.open_reader().unwrap();
        reader.close();
        assert!(reader.has_next().is_err());

        let mut second = journal.open_reader().unwrap();
        journal.close();
        assert!(matches!(
            second.has_next(),
            Err(JournalError::IllegalState { .. })
        ));
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        let appended = journal.append(77, b"round-trip payload").unwrap();

        let mut reader = journal.open_reader().unwrap();
        let read = reader.next().unwrap();

        assert_eq!(read.index(), appended.index());
        assert_eq!(read.asqn(), appended.asqn());
        assert_eq!(read.checksum(), appended.checksum());
        assert_eq!(read.data(), appended.data());
        assert_eq!(read.checksum(), crc32fast::hash(read.data()));
        assert_eq!(read.asqn(), 77);
    }

    #[test]
    fn ignored_asqn_round_trips() {
        let dir = tempdir().unwrap();
        let journal = SegmentedJournal::open(config(&dir)).unwrap();
        journal.append(ASQN_IGNORE, b"no sequence number").unwrap();

        let mut reader = journal.open_reader().unwrap();
        assert_eq!(reader.next().unwrap().asqn(), ASQN_IGNORE);
    }
}
