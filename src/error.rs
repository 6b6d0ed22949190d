//! Error types for the journal.
//!
//! Every error carries enough context to act on (paths, indexes, byte
//! counts). Display strings start with a stable code so log lines can be
//! grepped across versions.

use std::path::PathBuf;
use thiserror::Error;

/// The error type for all journal operations.
#[derive(Error, Debug)]
pub enum JournalError {
    // =========================================================================
    // Append-path errors (E100-E199)
    // =========================================================================
    /// A caller-supplied record does not continue the log.
    #[error("E101: record index {index} does not follow the journal tail, expected {expected}")]
    InvalidIndex {
        /// Index carried by the rejected record.
        index: u64,
        /// The next index the journal would accept.
        expected: u64,
    },

    /// A caller-supplied record's checksum does not match its payload.
    #[error(
        "E102: record checksum {actual:#010x} does not match computed payload checksum {expected:#010x}"
    )]
    InvalidChecksum {
        /// Checksum computed from the payload.
        expected: u32,
        /// Checksum carried by the rejected record.
        actual: u32,
    },

    /// The active segment cannot hold the next record.
    ///
    /// Handled internally by rolling over to a new segment; surfaced only
    /// when a single record cannot fit even in an empty segment.
    #[error("E103: segment full: record needs {needed} bytes, {available} remain")]
    SegmentFull {
        /// Encoded frame size of the record.
        needed: usize,
        /// Bytes left in the segment.
        available: usize,
    },

    // =========================================================================
    // Integrity errors (E200-E299)
    // =========================================================================
    /// A descriptor or an acknowledged record failed validation.
    ///
    /// Fatal: the journal refuses to open rather than serve data that was
    /// already acknowledged to replication.
    #[error("E201: corrupted log: {cause}")]
    CorruptedLog {
        /// Description of the detected corruption.
        cause: String,
    },

    /// A reader touched a segment that was deleted or reset under it.
    #[error("E202: segment {segment_id} was deleted while a reader was attached")]
    SegmentDeleted {
        /// Id of the deleted segment.
        segment_id: u64,
    },

    /// A handle was used after the journal was closed or reset.
    #[error("E203: illegal state: {cause}")]
    IllegalState {
        /// Why the handle is no longer usable.
        cause: String,
    },

    // =========================================================================
    // Environment errors (E300-E399)
    // =========================================================================
    /// An underlying file operation failed.
    #[error("E301: I/O failure at {path}: {cause}")]
    Io {
        /// Path of the file or directory involved.
        path: PathBuf,
        /// Underlying error message.
        cause: String,
    },

    /// Allocating a new segment would cross the free-disk-space floor.
    #[error("E302: out of disk: {available} bytes available, {required} required")]
    OutOfDisk {
        /// Bytes currently available on the volume.
        available: u64,
        /// Bytes that must stay available for the allocation to proceed.
        required: u64,
    },

    /// A configuration value failed validation at open.
    #[error("E303: invalid configuration '{field}': {cause}")]
    InvalidConfig {
        /// Name of the offending configuration field.
        field: String,
        /// Why the value was rejected.
        cause: String,
    },
}

impl JournalError {
    /// Returns the stable error code (e.g. "E201").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIndex { .. } => "E101",
            Self::InvalidChecksum { .. } => "E102",
            Self::SegmentFull { .. } => "E103",
            Self::CorruptedLog { .. } => "E201",
            Self::SegmentDeleted { .. } => "E202",
            Self::IllegalState { .. } => "E203",
            Self::Io { .. } => "E301",
            Self::OutOfDisk { .. } => "E302",
            Self::InvalidConfig { .. } => "E303",
        }
    }

    /// Whether this error indicates on-disk corruption of acknowledged data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedLog { .. })
    }

    /// Whether this error is the internal segment-full signal.
    #[must_use]
    pub fn is_segment_full(&self) -> bool {
        matches!(self, Self::SegmentFull { .. })
    }
}

/// Result type alias using [`JournalError`].
pub type Result<T> = std::result::Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let err = JournalError::CorruptedLog {
            cause: "bad frame".to_string(),
        };
        assert_eq!(err.code(), "E201");
        assert!(err.is_corruption());

        let err = JournalError::SegmentFull {
            needed: 64,
            available: 12,
        };
        assert_eq!(err.code(), "E103");
        assert!(err.is_segment_full());
    }

    #[test]
    fn error_display_includes_context() {
        let err = JournalError::InvalidIndex {
            index: 7,
            expected: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("E101"));
        assert!(msg.contains('7'));
        assert!(msg.contains('4'));

        let err = JournalError::OutOfDisk {
            available: 1024,
            required: 4096,
        };
        assert!(format!("{}", err).contains("1024"));
    }
}
