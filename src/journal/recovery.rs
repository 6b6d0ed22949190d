//! Open-time directory scan and segment loading.
//!
//! Open walks the journal directory, sweeps leftover `.log.deleted`
//! files, loads every segment in id order and rebuilds the sparse index
//! by scanning each one. Descriptor triage distinguishes three cases:
//!
//! - a partially written descriptor on the last, frameless segment is a
//!   crash during segment allocation — the file is re-initialised in
//!   place;
//! - an invalid descriptor on a segment that can only hold records above
//!   `last_written_index` means nothing acknowledged is lost — the
//!   segment (and everything after it) is discarded;
//! - an invalid descriptor on a segment that may hold acknowledged
//!   records is fatal.
//!
//! After per-segment recovery, consecutive segments must join exactly
//! (`next.first_index == prev.last_index + 1`); a gap below the
//! acknowledged bound is fatal.

use super::JournalConfig;
use crate::error::{JournalError, Result};
use crate::index::SparseIndex;
use crate::record::FRAME_RECORD;
use crate::segment::{
    is_deleted_segment_file, map_segment, parse_segment_id, DescriptorReadOutcome, Segment,
    SegmentDescriptor, SegmentFile, DESCRIPTOR_LEN,
};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Load all segments of the journal at `config.directory`.
///
/// Returns the segments keyed by their first index; empty when the
/// directory holds no usable segment.
pub(crate) fn load_segments(
    config: &JournalConfig,
    index: &Arc<SparseIndex>,
) -> Result<BTreeMap<u64, Segment>> {
    std::fs::create_dir_all(&config.directory).map_err(|e| JournalError::Io {
        path: config.directory.clone(),
        cause: e.to_string(),
    })?;

    let mut ids = sweep_directory(config)?;
    ids.sort_unstable();

    let mut segments = BTreeMap::new();
    let mut prev_last: u64 = 0;

    for (ordinal, &id) in ids.iter().enumerate() {
        let is_last = ordinal == ids.len() - 1;
        let file = SegmentFile::new(&config.directory, &config.name, id);
        let path = file.path();

        let mut handle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| JournalError::Io {
                path: path.clone(),
                cause: e.to_string(),
            })?;

        let mut header = [0u8; DESCRIPTOR_LEN];
        let read = read_up_to(&mut handle, &mut header).map_err(|e| JournalError::Io {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        match SegmentDescriptor::decode(&header[..read]) {
            DescriptorReadOutcome::Valid(descriptor)
                if descriptor.id() == id
                    && descriptor.max_segment_size() as usize > DESCRIPTOR_LEN =>
            {
                let expected_first = prev_last + 1;
                if descriptor.index() != expected_first && !segments.is_empty() {
                    if descriptor.index() < expected_first {
                        return Err(JournalError::CorruptedLog {
                            cause: format!(
                                "segment {} starts at index {} but the previous segment already covers up to {}",
                                id,
                                descriptor.index(),
                                prev_last
                            ),
                        });
                    }
                    if prev_last < config.last_written_index {
                        return Err(JournalError::CorruptedLog {
                            cause: format!(
                                "gap before segment {}: expected first index {}, found {}",
                                id,
                                expected_first,
                                descriptor.index()
                            ),
                        });
                    }
                    discard_from(config, &ids[ordinal..], Some(handle))?;
                    break;
                }

                let mmap = map_segment(&handle, &file, descriptor.max_segment_size())?;
                let segment = Segment::recover(
                    file,
                    handle,
                    mmap,
                    descriptor,
                    Arc::clone(index),
                    config.flush_explicitly,
                    config.last_written_index,
                )?;
                prev_last = segment.last_index();
                segments.insert(segment.first_index(), segment);
            }
            DescriptorReadOutcome::PartiallyWritten if is_last => {
                // Crash between file creation and descriptor write: the
                // file can hold no frames, so it is re-initialised as a
                // brand-new empty segment.
                let mmap = map_segment(&handle, &file, config.max_segment_size)?;
                if mmap[DESCRIPTOR_LEN] == FRAME_RECORD {
                    drop(mmap);
                    return handle_invalid(
                        config,
                        &ids[ordinal..],
                        id,
                        prev_last,
                        Some(handle),
                        &mut segments,
                    );
                }
                debug!(segment_id = id, "re-initialising partially written segment");
                let descriptor =
                    SegmentDescriptor::new(id, prev_last + 1, config.max_segment_size);
                let segment = Segment::init_existing(
                    file,
                    handle,
                    mmap,
                    descriptor,
                    Arc::clone(index),
                    config.flush_explicitly,
                )?;
                segments.insert(segment.first_index(), segment);
            }
            _ => {
                return handle_invalid(
                    config,
                    &ids[ordinal..],
                    id,
                    prev_last,
                    Some(handle),
                    &mut segments,
                );
            }
        }
    }

    Ok(segments)
}

/// Invalid-descriptor rule: fatal when the segment may hold acknowledged
/// records, otherwise drop it and everything after it.
fn handle_invalid(
    config: &JournalConfig,
    remaining: &[u64],
    id: u64,
    prev_last: u64,
    handle: Option<File>,
    segments: &mut BTreeMap<u64, Segment>,
) -> Result<BTreeMap<u64, Segment>> {
    if prev_last < config.last_written_index {
        return Err(JournalError::CorruptedLog {
            cause: format!(
                "segment {} has an unreadable descriptor but may contain acknowledged records (acknowledged up to {}, previous segment ends at {})",
                id, config.last_written_index, prev_last
            ),
        });
    }
    discard_from(config, remaining, handle)?;
    Ok(std::mem::take(segments))
}

/// Unlink the given segment files; they hold nothing acknowledged.
fn discard_from(config: &JournalConfig, ids: &[u64], handle: Option<File>) -> Result<()> {
    drop(handle);
    for &id in ids {
        let file = SegmentFile::new(&config.directory, &config.name, id);
        warn!(
            segment_id = id,
            path = %file.path().display(),
            "discarding unreadable segment holding no acknowledged records"
        );
        std::fs::remove_file(file.path()).map_err(|e| JournalError::Io {
            path: file.path(),
            cause: e.to_string(),
        })?;
    }
    Ok(())
}

/// Remove leftover `.log.deleted` files and collect segment ids.
fn sweep_directory(config: &JournalConfig) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let entries = std::fs::read_dir(&config.directory).map_err(|e| JournalError::Io {
        path: config.directory.clone(),
        cause: e.to_string(),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| JournalError::Io {
            path: config.directory.clone(),
            cause: e.to_string(),
        })?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        if is_deleted_segment_file(&config.name, name) {
            // Nothing pins segments on a cold open.
            debug!(file = name, "removing segment marked for deletion");
            remove_entry(&entry.path())?;
        } else if let Some(id) = parse_segment_id(&config.name, name, ".log") {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn remove_entry(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|e| JournalError::Io {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })
}

fn read_up_to(handle: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match handle.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
