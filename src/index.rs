//! Sparse in-memory index from record index to byte position.
//!
//! One `SparseIndex` exists per journal and is shared with every segment.
//! Every `density`-th record (plus the first record of each segment)
//! produces an entry, so a seek jumps to the closest indexed position and
//! linear-scans at most `density - 1` frames from there.
//!
//! Lookups are floor semantics over a `BTreeMap`: the entry with the
//! greatest index at or below the target, `None` if no such entry exists.
//! Callers fall back to the segment descriptor's start index in that case.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One sparse-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// Record index the entry points at.
    pub index: u64,
    /// Byte position of the record's frame within its segment.
    pub position: u32,
    /// Id of the segment holding the record.
    pub segment_id: u64,
}

/// Sparse position map shared between the journal and its segments.
#[derive(Debug)]
pub(crate) struct SparseIndex {
    density: u64,
    entries: RwLock<BTreeMap<u64, IndexEntry>>,
}

impl SparseIndex {
    /// Create an empty index recording every `density`-th record.
    pub fn new(density: u64) -> Self {
        debug_assert!(density >= 1);
        Self {
            density,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record `index -> position` if the index falls on a density boundary
    /// or starts a segment.
    pub fn index_record(&self, index: u64, position: u32, segment_id: u64, first_in_segment: bool) {
        if first_in_segment || index % self.density == 0 {
            self.entries.write().insert(
                index,
                IndexEntry {
                    index,
                    position,
                    segment_id,
                },
            );
        }
    }

    /// Entry with the greatest index at or below `target`.
    pub fn lookup(&self, target: u64) -> Option<IndexEntry> {
        self.entries
            .read()
            .range((Bound::Unbounded, Bound::Included(target)))
            .next_back()
            .map(|(_, entry)| *entry)
    }

    /// Remove all entries with an index above `index`.
    pub fn delete_after(&self, index: u64) {
        self.entries.write().split_off(&(index + 1));
    }

    /// Remove all entries with an index below `index`.
    pub fn delete_until(&self, index: u64) {
        let mut entries = self.entries.write();
        let retained = entries.split_off(&index);
        *entries = retained;
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_indexes(index: &SparseIndex) -> Vec<u64> {
        index.entries.read().keys().copied().collect()
    }

    #[test]
    fn lookup_is_floor() {
        let index = SparseIndex::new(5);
        for i in 1..=20 {
            index.index_record(i, (i * 100) as u32, 1, false);
        }
        // Density 5 keeps 5, 10, 15, 20.
        assert_eq!(entry_indexes(&index), vec![5, 10, 15, 20]);

        assert_eq!(index.lookup(4), None);
        assert_eq!(index.lookup(5).unwrap().index, 5);
        assert_eq!(index.lookup(7).unwrap().index, 5);
        assert_eq!(index.lookup(10).unwrap().position, 1000);
        assert_eq!(index.lookup(99).unwrap().index, 20);
    }

    #[test]
    fn first_record_of_segment_is_always_indexed() {
        let index = SparseIndex::new(100);
        index.index_record(3, 32, 2, true);
        index.index_record(4, 96, 2, false);

        let entry = index.lookup(4).unwrap();
        assert_eq!(entry.index, 3);
        assert_eq!(entry.segment_id, 2);
    }

    #[test]
    fn delete_after_drops_higher_entries() {
        let index = SparseIndex::new(1);
        for i in 1..=4 {
            index.index_record(i, i as u32, 1, false);
        }

        index.delete_after(2);

        assert_eq!(index.lookup(4).unwrap().index, 2);
        assert_eq!(entry_indexes(&index), vec![1, 2]);
    }

    #[test]
    fn delete_until_drops_lower_entries() {
        let index = SparseIndex::new(1);
        for i in 1..=4 {
            index.index_record(i, i as u32, 1, false);
        }

        index.delete_until(3);

        assert_eq!(index.lookup(2), None);
        assert_eq!(entry_indexes(&index), vec![3, 4]);
    }

    #[test]
    fn clear_empties_the_index() {
        let index = SparseIndex::new(1);
        index.index_record(1, 1, 1, false);
        index.clear();
        assert_eq!(index.lookup(1), None);
    }
}
