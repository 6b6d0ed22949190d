//! # keel
//!
//! A segmented, append-only, crash-safe journal: the durable log of a
//! replicated state machine. Monotonically increasing 64-bit indexes map
//! to opaque record payloads, backed by a directory of fixed-size
//! memory-mapped segment files.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SegmentedJournal                        │
//! │     append / delete_after / delete_until / reset / read      │
//! └───────────────┬────────────────────────────┬────────────────┘
//!                 │                            │
//!        ┌────────▼────────┐          ┌────────▼────────┐
//!        │  Segment (mmap) │  ──────  │  Segment (mmap) │   ...
//!        │  writer+readers │  rolls   │  writer+readers │
//!        └────────┬────────┘  over    └────────┬────────┘
//!                 │                            │
//!        ┌────────▼────────────────────────────▼────────┐
//!        │   <name>-<id>.log files, 32 B descriptor +   │
//!        │   CRC32-framed records, little-endian        │
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **Contiguous indexing**: appends return `first_index, first_index+1,
//!   ...` with no gaps; the replication path rejects anything else.
//! - **Crash safety**: frames are checksummed and metadata is written
//!   last, so recovery can always tell a torn tail (discarded silently)
//!   from corruption of acknowledged data (fatal).
//! - **Single writer, many readers**: mutations are serialised by the
//!   caller; readers run on their own threads over shared read views.
//! - **Deferred deletion**: truncation, compaction and reset rename
//!   segments to `.log.deleted` and unlink the bytes only once the last
//!   reader lets go.
//!
//! # Example
//!
//! ```no_run
//! use keel::{JournalConfig, SegmentedJournal, ASQN_IGNORE};
//!
//! # fn main() -> keel::Result<()> {
//! let journal = SegmentedJournal::open(
//!     JournalConfig::default().with_directory("/var/lib/keel"),
//! )?;
//!
//! let record = journal.append(ASQN_IGNORE, b"hello")?;
//! assert_eq!(record.index(), journal.last_index());
//!
//! let mut reader = journal.open_reader()?;
//! while reader.has_next()? {
//!     let record = reader.next()?;
//!     println!("{} -> {} bytes", record.index(), record.data().len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod journal;
pub mod prelude;
pub mod record;
pub mod segment;

mod index;

pub use error::{JournalError, Result};
pub use journal::{JournalConfig, JournalReader, SegmentedJournal};
pub use record::{JournalRecord, ASQN_IGNORE};
pub use segment::{is_deleted_segment_file, is_segment_file};
