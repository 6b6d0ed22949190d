//! The segmented journal: directory-level orchestration.
//!
//! A journal is a directory of fixed-size segment files. Appends go to
//! the active (last) segment and roll over to a fresh segment when the
//! next record would not fit. Reads go through [`JournalReader`], which
//! walks segments transparently. `delete_after` truncates the tail,
//! `delete_until` compacts the head, and `reset` discards everything and
//! restarts the log at an arbitrary next index.
//!
//! # Concurrency contract
//!
//! Single writer, multiple readers. All mutating calls (`append*`,
//! `delete_after`, `delete_until`, `reset`, `close`) must be serialised
//! by the caller — typically the Raft leader loop. Readers may run on
//! independent threads, each owning its own [`JournalReader`]; the reader
//! handle itself is not thread-safe. A record returned by an append is
//! visible to every reader created afterwards, and to existing readers on
//! their next `has_next`.

mod reader;
pub(crate) mod recovery;

pub use reader::JournalReader;

use crate::error::{JournalError, Result};
use crate::index::SparseIndex;
use crate::record::{self, JournalRecord};
use crate::segment::{Segment, SegmentDescriptor, SegmentFile, SegmentWriter, DESCRIPTOR_LEN};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Configuration of a [`SegmentedJournal`].
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory the segment files live in; created if missing.
    pub directory: PathBuf,
    /// File-name prefix of the segments.
    pub name: String,
    /// Segment capacity in bytes, descriptor included.
    pub max_segment_size: u32,
    /// Records between two sparse-index entries.
    pub index_density: u64,
    /// Acknowledged upper bound: corruption at or below this index is
    /// fatal at open, anything above is recoverable tail damage.
    pub last_written_index: u64,
    /// Flush the pages touched by an append before the append returns.
    /// When off, durability relies on OS writeback plus the recovery
    /// scan's torn-tail tolerance.
    pub flush_explicitly: bool,
    /// Minimum bytes that must stay free on the volume; allocating a new
    /// segment fails once the floor would be crossed. Zero disables the
    /// guard.
    pub free_disk_space: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/keel"),
            name: "journal".to_string(),
            max_segment_size: 32 * 1024 * 1024,
            index_density: 100,
            last_written_index: 0,
            flush_explicitly: true,
            free_disk_space: 0,
        }
    }
}

impl JournalConfig {
    /// Set the journal directory.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Set the segment file-name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the segment capacity in bytes (descriptor included).
    #[must_use]
    pub fn with_max_segment_size(mut self, bytes: u32) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Set the sparse-index density.
    #[must_use]
    pub fn with_index_density(mut self, density: u64) -> Self {
        self.index_density = density;
        self
    }

    /// Set the acknowledged upper bound used during recovery.
    #[must_use]
    pub fn with_last_written_index(mut self, index: u64) -> Self {
        self.last_written_index = index;
        self
    }

    /// Enable or disable per-append page flushing.
    #[must_use]
    pub fn with_flush_explicitly(mut self, flush: bool) -> Self {
        self.flush_explicitly = flush;
        self
    }

    /// Set the free-disk-space floor in bytes.
    #[must_use]
    pub fn with_free_disk_space(mut self, bytes: u64) -> Self {
        self.free_disk_space = bytes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(std::path::MAIN_SEPARATOR) {
            return Err(JournalError::InvalidConfig {
                field: "name".to_string(),
                cause: "must be a non-empty file-name prefix".to_string(),
            });
        }
        let min_size = DESCRIPTOR_LEN + record::frame_length(0) + 1;
        if (self.max_segment_size as usize) < min_size {
            return Err(JournalError::InvalidConfig {
                field: "max_segment_size".to_string(),
                cause: format!("must be at least {} bytes", min_size),
            });
        }
        if self.index_density == 0 {
            return Err(JournalError::InvalidConfig {
                field: "index_density".to_string(),
                cause: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct JournalShared {
    pub(crate) config: JournalConfig,
    pub(crate) index: Arc<SparseIndex>,
    pub(crate) inner: RwLock<JournalInner>,
}

#[derive(Debug)]
pub(crate) struct JournalInner {
    /// Live segments keyed by their first index.
    pub(crate) segments: BTreeMap<u64, Segment>,
    pub(crate) open: bool,
    /// Bumped on `reset`; outstanding readers holding an older value are
    /// permanently invalidated.
    pub(crate) reset_epoch: u64,
}

impl JournalInner {
    pub(crate) fn first_index(&self) -> u64 {
        self.segments
            .keys()
            .next()
            .copied()
            .unwrap_or(1)
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.segments
            .values()
            .next_back()
            .map(Segment::last_index)
            .unwrap_or(0)
    }
}

/// Segmented, append-only, crash-safe journal.
///
/// See the [module documentation](self) for the concurrency contract.
#[derive(Debug)]
pub struct SegmentedJournal {
    shared: Arc<JournalShared>,
}

impl SegmentedJournal {
    /// Open (or create) the journal at `config.directory`, recovering
    /// from torn writes and rebuilding the sparse index.
    ///
    /// Fails with [`JournalError::CorruptedLog`] when a descriptor or a
    /// record at or below `config.last_written_index` does not validate.
    pub fn open(config: JournalConfig) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(SparseIndex::new(config.index_density));
        let mut segments = recovery::load_segments(&config, &index)?;

        if segments.is_empty() {
            let segment = allocate_segment(&config, &index, 1, 1)?;
            segments.insert(1, segment);
        }
        debug!(
            directory = %config.directory.display(),
            segment_count = segments.len(),
            "opened journal"
        );

        Ok(Self {
            shared: Arc::new(JournalShared {
                config,
                index,
                inner: RwLock::new(JournalInner {
                    segments,
                    open: true,
                    reset_epoch: 0,
                }),
            }),
        })
    }

    /// Append a new record with the given application sequence number
    /// ([`crate::ASQN_IGNORE`] for none) and payload.
    ///
    /// Assigns the next index, rolling over to a fresh segment when the
    /// active one is full.
    pub fn append(&self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
        self.append_with(|writer| writer.append(asqn, data))
    }

    /// Append a record received from another node (replication path).
    ///
    /// Fails with [`JournalError::InvalidIndex`] unless the record
    /// continues the log exactly, and with
    /// [`JournalError::InvalidChecksum`] when its checksum does not match
    /// its payload.
    pub fn append_record(&self, record: &JournalRecord) -> Result<JournalRecord> {
        self.append_with(|writer| writer.append_record(record))
    }

    fn append_with(
        &self,
        mut attempt: impl FnMut(&SegmentWriter) -> Result<JournalRecord>,
    ) -> Result<JournalRecord> {
        let (writer, segment_empty) = self.active_writer()?;
        match attempt(&writer) {
            Err(e) if e.is_segment_full() => {
                if segment_empty {
                    // Even a fresh segment cannot hold this record.
                    return Err(e);
                }
                self.roll_over()?;
                let (writer, _) = self.active_writer()?;
                attempt(&writer)
            }
            other => other,
        }
    }

    fn active_writer(&self) -> Result<(SegmentWriter, bool)> {
        let inner = self.shared.inner.read();
        self.check_open(&inner)?;
        let segment = inner
            .segments
            .values()
            .next_back()
            .expect("an open journal always has an active segment");
        Ok((segment.writer(), segment.is_empty()))
    }

    fn roll_over(&self) -> Result<()> {
        let mut inner = self.shared.inner.write();
        self.check_open(&inner)?;
        let last = inner
            .segments
            .values()
            .next_back()
            .expect("an open journal always has an active segment");
        let id = last.id() + 1;
        let first_index = last.next_index();
        let segment = allocate_segment(&self.shared.config, &self.shared.index, id, first_index)?;
        debug!(segment_id = id, first_index, "rolled over to new segment");
        inner.segments.insert(first_index, segment);
        Ok(())
    }

    /// Truncate the tail: after the call, `index` is the last record.
    ///
    /// No-op when `index >= last_index()`. Segments past the truncation
    /// point are deleted (deferred while readers pin them); the journal
    /// always keeps its first segment, so the result satisfies
    /// `last_index() == max(index, first_index() - 1)`.
    pub fn delete_after(&self, index: u64) -> Result<()> {
        let mut inner = self.shared.inner.write();
        self.check_open(&inner)?;
        if index >= inner.last_index() {
            return Ok(());
        }

        let keep_key = inner
            .segments
            .range(..=index)
            .next_back()
            .map(|(k, _)| *k)
            .unwrap_or_else(|| inner.first_index());
        let removed: Vec<u64> = inner
            .segments
            .range((Bound::Excluded(keep_key), Bound::Unbounded))
            .map(|(k, _)| *k)
            .collect();
        for key in removed {
            let segment = inner
                .segments
                .remove(&key)
                .expect("key was just enumerated");
            segment.delete()?;
        }

        let keep = inner
            .segments
            .get(&keep_key)
            .expect("the first segment is never removed")
            .clone();
        keep.writer().truncate(index)?;
        self.shared.index.delete_after(index);
        Ok(())
    }

    /// Compact the head: delete every segment whose successor starts at
    /// or below `index`.
    ///
    /// The segment containing `index - 1` survives, as does the active
    /// segment; afterwards `first_index()` is the start of the oldest
    /// remaining segment.
    pub fn delete_until(&self, index: u64) -> Result<()> {
        let mut inner = self.shared.inner.write();
        self.check_open(&inner)?;

        let Some(keep_key) = inner.segments.range(..=index).next_back().map(|(k, _)| *k) else {
            return Ok(());
        };
        let removed: Vec<u64> = inner
            .segments
            .range(..keep_key)
            .map(|(k, _)| *k)
            .collect();
        for key in removed {
            let segment = inner
                .segments
                .remove(&key)
                .expect("key was just enumerated");
            segment.delete()?;
        }
        let first_index = inner.first_index();
        self.shared.index.delete_until(first_index);
        debug!(first_index, "compacted journal head");
        Ok(())
    }

    /// Discard the entire log and restart it so the next appended record
    /// receives index `next_index`.
    ///
    /// Existing segments are marked for deletion (readers pinning them
    /// keep the bytes on disk until they close); all outstanding readers
    /// are invalidated.
    pub fn reset(&self, next_index: u64) -> Result<()> {
        let mut inner = self.shared.inner.write();
        self.check_open(&inner)?;

        let next_id = inner
            .segments
            .values()
            .next_back()
            .map(|s| s.id() + 1)
            .unwrap_or(1);
        // Allocate first: a failed allocation must leave the log intact.
        let segment = allocate_segment(&self.shared.config, &self.shared.index, next_id, next_index)?;

        let old: Vec<Segment> = inner.segments.values().cloned().collect();
        inner.segments.clear();
        for segment in old {
            segment.delete()?;
        }
        self.shared.index.clear();
        inner.segments.insert(next_index, segment);
        inner.reset_epoch += 1;
        debug!(next_index, "reset journal");
        Ok(())
    }

    /// Index of the first record in the journal (the descriptor index of
    /// the oldest segment).
    pub fn first_index(&self) -> u64 {
        self.shared.inner.read().first_index()
    }

    /// Index of the last record; `first_index() - 1` when the journal is
    /// empty.
    pub fn last_index(&self) -> u64 {
        self.shared.inner.read().last_index()
    }

    /// Whether the journal holds no records.
    pub fn is_empty(&self) -> bool {
        let inner = self.shared.inner.read();
        inner.last_index() < inner.first_index()
    }

    /// Whether the journal is open.
    pub fn is_open(&self) -> bool {
        self.shared.inner.read().open
    }

    /// Open a reader positioned at the first record.
    pub fn open_reader(&self) -> Result<JournalReader> {
        let inner = self.shared.inner.read();
        self.check_open(&inner)?;
        let first = inner
            .segments
            .values()
            .next()
            .expect("an open journal always has a segment")
            .clone();
        let epoch = inner.reset_epoch;
        drop(inner);
        JournalReader::new(Arc::clone(&self.shared), first, epoch)
    }

    /// Close the journal: every segment is flushed, unmapped and
    /// unlocked, outstanding readers fail from now on, and deferred
    /// `.log.deleted` files are unlinked.
    pub fn close(&self) {
        let mut inner = self.shared.inner.write();
        if !inner.open {
            return;
        }
        inner.open = false;
        for segment in inner.segments.values() {
            segment.close();
        }
        inner.segments.clear();
        debug!("closed journal");
    }

    fn check_open(&self, inner: &JournalInner) -> Result<()> {
        if !inner.open {
            return Err(JournalError::IllegalState {
                cause: "journal is closed".to_string(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sparse_index(&self) -> &SparseIndex {
        &self.shared.index
    }
}

impl Drop for SegmentedJournal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a fresh segment, honoring the free-disk-space floor.
fn allocate_segment(
    config: &JournalConfig,
    index: &Arc<SparseIndex>,
    id: u64,
    first_index: u64,
) -> Result<Segment> {
    if config.free_disk_space > 0 {
        let available =
            fs2::available_space(&config.directory).map_err(|e| JournalError::Io {
                path: config.directory.clone(),
                cause: e.to_string(),
            })?;
        let required = config
            .free_disk_space
            .saturating_add(u64::from(config.max_segment_size));
        if available < required {
            return Err(JournalError::OutOfDisk {
                available,
                required,
            });
        }
    }

    Segment::create(
        SegmentFile::new(&config.directory, &config.name, id),
        SegmentDescriptor::new(id, first_index, config.max_segment_size),
        Arc::clone(index),
        config.flush_explicitly,
    )
}
