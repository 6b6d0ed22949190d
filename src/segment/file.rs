//! Segment file naming and durable file-system plumbing.
//!
//! Active segments are named `<journal-name>-<id>.log`; a segment marked
//! for deletion is renamed to `<journal-name>-<id>.log.deleted` and its
//! bytes are unlinked only once no reader references it. Renames and
//! segment creation fsync the parent directory so the name change itself
//! survives a crash.

use crate::error::{JournalError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Suffix of an active segment file.
const SEGMENT_SUFFIX: &str = ".log";

/// Suffix of a segment file marked for deletion.
const DELETED_SUFFIX: &str = ".log.deleted";

/// Whether `file_name` names an active segment of journal `name`.
#[must_use]
pub fn is_segment_file(name: &str, file_name: &str) -> bool {
    parse_segment_id(name, file_name, SEGMENT_SUFFIX).is_some()
}

/// Whether `file_name` names a segment of journal `name` that is marked
/// for deletion.
#[must_use]
pub fn is_deleted_segment_file(name: &str, file_name: &str) -> bool {
    parse_segment_id(name, file_name, DELETED_SUFFIX).is_some()
}

/// Extract the segment id from `<name>-<id><suffix>`, if it matches.
pub(crate) fn parse_segment_id(name: &str, file_name: &str, suffix: &str) -> Option<u64> {
    file_name
        .strip_prefix(name)?
        .strip_prefix('-')?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}

/// Paths of one segment on disk.
#[derive(Debug, Clone)]
pub(crate) struct SegmentFile {
    directory: PathBuf,
    name: String,
    id: u64,
}

impl SegmentFile {
    pub fn new(directory: &Path, name: &str, id: u64) -> Self {
        Self {
            directory: directory.to_path_buf(),
            name: name.to_string(),
            id,
        }
    }

    /// Path of the active `.log` file.
    pub fn path(&self) -> PathBuf {
        self.directory
            .join(format!("{}-{}{}", self.name, self.id, SEGMENT_SUFFIX))
    }

    /// Path of the `.log.deleted` file the segment is renamed to.
    pub fn deleted_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}-{}{}", self.name, self.id, DELETED_SUFFIX))
    }

    /// Directory holding the segment.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Fsync a directory so previously performed renames/creations within it
/// are durable.
pub(crate) fn sync_directory(dir: &Path) -> Result<()> {
    let handle = File::open(dir).map_err(|e| JournalError::Io {
        path: dir.to_path_buf(),
        cause: e.to_string(),
    })?;
    handle.sync_all().map_err(|e| JournalError::Io {
        path: dir.to_path_buf(),
        cause: e.to_string(),
    })
}

/// Rename `from` to `to` and fsync the parent directory.
pub(crate) fn rename_durably(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| JournalError::Io {
        path: from.to_path_buf(),
        cause: format!("rename to {} failed: {}", to.display(), e),
    })?;
    let parent = to.parent().unwrap_or_else(|| Path::new("."));
    sync_directory(parent)
}
