//! Memory-mapped log segments.
//!
//! A segment is one file holding a contiguous range of record indexes,
//! fronted by a writable memory map. The segment is the ownership
//! boundary of the journal: it binds the descriptor, the map, the single
//! writer cursor and the set of open readers, and it enforces the
//! two-phase deletion protocol — a deleted segment is first renamed to
//! `.log.deleted`, and its bytes are unlinked only once the last reader
//! has closed.
//!
//! `Segment` is a cheap cloneable handle over `Arc`-shared state; writer
//! and reader handles clone it, so the map stays alive exactly as long as
//! someone can still touch it.

mod descriptor;
mod file;
mod reader;
mod writer;

pub use file::{is_deleted_segment_file, is_segment_file};

pub(crate) use descriptor::{DescriptorReadOutcome, SegmentDescriptor, DESCRIPTOR_LEN};
pub(crate) use file::{parse_segment_id, rename_durably, sync_directory, SegmentFile};
pub(crate) use reader::SegmentReader;
pub(crate) use writer::SegmentWriter;

use crate::error::{JournalError, Result};
use crate::index::SparseIndex;
use crate::record::{self, FrameReadOutcome, FRAME_EMPTY};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared per-segment state.
#[derive(Debug)]
pub(crate) struct SegmentInner {
    descriptor: SegmentDescriptor,
    file: SegmentFile,
    index: Arc<SparseIndex>,
    flush_explicitly: bool,
    state: RwLock<SegmentState>,
}

/// Mutable part of a segment, guarded by one lock.
#[derive(Debug)]
pub(crate) struct SegmentState {
    /// Writable map over the segment file; `None` once unmapped.
    mmap: Option<MmapMut>,
    /// Underlying file handle, held for the advisory lock's lifetime.
    handle: Option<File>,
    /// Byte offset of the next frame to write.
    write_pos: usize,
    /// Index the next appended record receives.
    next_index: u64,
    /// Bumped on every truncate/reset so readers re-synchronise lazily.
    epoch: u64,
    open: bool,
    marked_for_deletion: bool,
    reader_count: usize,
}

/// Handle to one log segment.
#[derive(Clone, Debug)]
pub(crate) struct Segment {
    inner: Arc<SegmentInner>,
}

impl Segment {
    /// Create a brand-new segment file: preallocate, lock, map, write the
    /// descriptor and fsync the directory so the file name is durable.
    pub fn create(
        file: SegmentFile,
        descriptor: SegmentDescriptor,
        index: Arc<SparseIndex>,
        flush_explicitly: bool,
    ) -> Result<Self> {
        let path = file.path();
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| JournalError::Io {
                path: path.clone(),
                cause: e.to_string(),
            })?;

        let mmap = map_segment(&handle, &file, descriptor.max_segment_size())?;
        let segment = Self::init_existing(file, handle, mmap, descriptor, index, flush_explicitly)?;
        sync_directory(segment.inner.file.directory())?;
        Ok(segment)
    }

    /// Initialise an already opened and mapped file as an empty segment.
    ///
    /// Also the repair path for a file whose descriptor was never written.
    pub fn init_existing(
        file: SegmentFile,
        handle: File,
        mut mmap: MmapMut,
        descriptor: SegmentDescriptor,
        index: Arc<SparseIndex>,
        flush_explicitly: bool,
    ) -> Result<Self> {
        descriptor.encode(&mut mmap[..DESCRIPTOR_LEN]);
        mmap[DESCRIPTOR_LEN] = FRAME_EMPTY;
        mmap.flush_range(0, DESCRIPTOR_LEN + 1)
            .map_err(|e| JournalError::Io {
                path: file.path(),
                cause: e.to_string(),
            })?;

        Ok(Self::assemble(
            file,
            handle,
            mmap,
            descriptor,
            index,
            flush_explicitly,
            DESCRIPTOR_LEN,
            descriptor.index(),
        ))
    }

    /// Reconstruct a segment from existing content by scanning its frames.
    ///
    /// The scan stops at the first invalid frame-type byte (clean end of
    /// segment). A frame that fails validation is fatal when its index is
    /// at or below `last_written_index` (that record was acknowledged);
    /// otherwise it is a torn tail and the segment is truncated at the
    /// last good frame. Every good record re-populates the sparse index.
    pub fn recover(
        file: SegmentFile,
        handle: File,
        mut mmap: MmapMut,
        descriptor: SegmentDescriptor,
        index: Arc<SparseIndex>,
        flush_explicitly: bool,
        last_written_index: u64,
    ) -> Result<Self> {
        let capacity = descriptor.max_segment_size() as usize;
        let mut pos = DESCRIPTOR_LEN;
        let mut next_index = descriptor.index();

        loop {
            match record::read_frame(&mmap[..capacity], pos, capacity, Some(next_index)) {
                FrameReadOutcome::Record { length, .. } => {
                    index.index_record(
                        next_index,
                        pos as u32,
                        descriptor.id(),
                        next_index == descriptor.index(),
                    );
                    pos += length;
                    next_index += 1;
                }
                FrameReadOutcome::EndOfSegment => break,
                FrameReadOutcome::Corrupt { cause } => {
                    if next_index <= last_written_index {
                        return Err(JournalError::CorruptedLog {
                            cause: format!(
                                "segment {}: record {} was acknowledged but does not validate: {}",
                                descriptor.id(),
                                next_index,
                                cause
                            ),
                        });
                    }
                    warn!(
                        segment_id = descriptor.id(),
                        index = next_index,
                        %cause,
                        "discarding torn tail"
                    );
                    mmap[pos] = FRAME_EMPTY;
                    mmap.flush_range(pos, 1).map_err(|e| JournalError::Io {
                        path: file.path(),
                        cause: e.to_string(),
                    })?;
                    break;
                }
            }
        }

        debug!(
            segment_id = descriptor.id(),
            first_index = descriptor.index(),
            next_index,
            "recovered segment"
        );
        Ok(Self::assemble(
            file,
            handle,
            mmap,
            descriptor,
            index,
            flush_explicitly,
            pos,
            next_index,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        file: SegmentFile,
        handle: File,
        mmap: MmapMut,
        descriptor: SegmentDescriptor,
        index: Arc<SparseIndex>,
        flush_explicitly: bool,
        write_pos: usize,
        next_index: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SegmentInner {
                descriptor,
                file,
                index,
                flush_explicitly,
                state: RwLock::new(SegmentState {
                    mmap: Some(mmap),
                    handle: Some(handle),
                    write_pos,
                    next_index,
                    epoch: 0,
                    open: true,
                    marked_for_deletion: false,
                    reader_count: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.descriptor.id()
    }

    /// First record index this segment may hold.
    pub fn first_index(&self) -> u64 {
        self.inner.descriptor.index()
    }

    /// Index of the last record in the segment; `first_index - 1` if empty.
    pub fn last_index(&self) -> u64 {
        self.inner.state.read().next_index - 1
    }

    /// Index the next appended record receives.
    pub fn next_index(&self) -> u64 {
        self.inner.state.read().next_index
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.read().write_pos == DESCRIPTOR_LEN
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.read().open
    }

    /// Whether the segment can still serve reads.
    pub fn is_alive(&self) -> bool {
        let state = self.inner.state.read();
        state.open && !state.marked_for_deletion && state.mmap.is_some()
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        self.inner.descriptor
    }

    /// Single append handle for this segment.
    pub fn writer(&self) -> SegmentWriter {
        SegmentWriter::new(self.clone())
    }

    /// Register a new reader positioned at the start of the segment.
    pub fn create_reader(&self) -> Result<SegmentReader> {
        let mut state = self.inner.state.write();
        if !state.open || state.marked_for_deletion {
            return Err(JournalError::IllegalState {
                cause: format!("cannot read segment {}: segment is not open", self.id()),
            });
        }
        state.reader_count += 1;
        Ok(SegmentReader::new(self.clone(), state.epoch))
    }

    /// Reader bookkeeping: once the last reader of a marked segment
    /// leaves, the bytes are unlinked.
    pub(crate) fn on_reader_closed(&self) {
        let mut state = self.inner.state.write();
        state.reader_count = state.reader_count.saturating_sub(1);
        if state.marked_for_deletion && state.reader_count == 0 {
            self.purge(&mut state);
        }
    }

    /// Mark the segment for deletion: stop the writer, durably rename the
    /// file to `.log.deleted`, and unlink immediately when no reader pins
    /// it.
    pub fn delete(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.marked_for_deletion {
            return Ok(());
        }
        state.open = false;
        if self.inner.file.path().exists() {
            rename_durably(&self.inner.file.path(), &self.inner.file.deleted_path())?;
        }
        state.marked_for_deletion = true;
        if state.reader_count == 0 {
            self.purge(&mut state);
        }
        Ok(())
    }

    /// Close the segment: flush, unmap, release the file lock. Deferred
    /// `.log.deleted` bytes are unlinked here as well, since close tears
    /// down every reader's access anyway.
    pub fn close(&self) {
        let mut state = self.inner.state.write();
        state.open = false;
        if let Some(mmap) = state.mmap.take() {
            if let Err(e) = mmap.flush() {
                warn!(
                    segment_id = self.id(),
                    error = %e,
                    "flush on close failed"
                );
            }
        }
        if let Some(handle) = state.handle.take() {
            let _ = FileExt::unlock(&handle);
        }
        if state.marked_for_deletion {
            remove_quietly(&self.inner.file.deleted_path(), self.id());
        }
    }

    fn purge(&self, state: &mut SegmentState) {
        state.mmap = None;
        if let Some(handle) = state.handle.take() {
            let _ = FileExt::unlock(&handle);
        }
        remove_quietly(&self.inner.file.deleted_path(), self.id());
    }

    pub(crate) fn inner(&self) -> &Arc<SegmentInner> {
        &self.inner
    }
}

impl SegmentInner {
    pub(crate) fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    pub(crate) fn file(&self) -> &SegmentFile {
        &self.file
    }

    pub(crate) fn index(&self) -> &SparseIndex {
        &self.index
    }

    pub(crate) fn flush_explicitly(&self) -> bool {
        self.flush_explicitly
    }

    pub(crate) fn state(&self) -> &RwLock<SegmentState> {
        &self.state
    }
}

impl SegmentState {
    pub(crate) fn mmap(&self) -> Option<&MmapMut> {
        self.mmap.as_ref()
    }

    pub(crate) fn mmap_mut(&mut self) -> Option<&mut MmapMut> {
        self.mmap.as_mut()
    }

    pub(crate) fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub(crate) fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos;
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.next_index
    }

    pub(crate) fn set_next_index(&mut self, index: u64) {
        self.next_index = index;
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.open && !self.marked_for_deletion && self.mmap.is_some()
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.open && !self.marked_for_deletion && self.mmap.is_some()
    }

    pub(crate) fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }
}

/// Size the file to the segment capacity and map it writable.
pub(crate) fn map_segment(handle: &File, file: &SegmentFile, capacity: u32) -> Result<MmapMut> {
    let io_err = |e: std::io::Error| JournalError::Io {
        path: file.path(),
        cause: e.to_string(),
    };

    handle.try_lock_exclusive().map_err(|e| JournalError::Io {
        path: file.path(),
        cause: format!("failed to lock segment file: {}", e),
    })?;

    let len = handle.metadata().map_err(io_err)?.len();
    if len < u64::from(capacity) {
        handle.set_len(u64::from(capacity)).map_err(io_err)?;
    }

    // SAFETY: the file is exclusively locked by this process and sized to
    // at least `capacity`; the journal's data directory contract forbids
    // external mutation while the journal is open.
    let mmap = unsafe {
        MmapOptions::new()
            .len(capacity as usize)
            .map_mut(handle)
            .map_err(io_err)?
    };
    Ok(mmap)
}

fn remove_quietly(path: &std::path::Path, segment_id: u64) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                segment_id,
                path = %path.display(),
                error = %e,
                "could not unlink deleted segment, disk usage may grow"
            );
        }
    }
}
