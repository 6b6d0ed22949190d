//! Prelude for convenient imports.
//!
//! # Example
//!
//! ```ignore
//! use keel::prelude::*;
//! ```

// Journal
pub use crate::journal::{JournalConfig, JournalReader, SegmentedJournal};

// Records
pub use crate::record::{JournalRecord, ASQN_IGNORE};

// Error handling
pub use crate::error::{JournalError, Result};

// File classification
pub use crate::segment::{is_deleted_segment_file, is_segment_file};
