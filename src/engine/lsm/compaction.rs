//! LETHE - Compaction of the LSM stand-in
//!
//! A compaction moves every key of a range into an output level, folding
//! pending merge operands and dropping tombstones once they reach the last
//! level. The surviving entries are reported back to the blob coordinators
//! as a [`CompactionEvent`], which is how level merge, range merge and
//! fallback conversion learn which blob values were touched.

use serde::{Deserialize, Serialize};

use super::memtable::MemTable;
use crate::types::{Key, StoredValue};

/// Closed key range `[smallest, largest]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub smallest: Key,
    pub largest: Key,
}

impl KeyRange {
    pub fn new(smallest: Key, largest: Key) -> Self {
        Self { smallest, largest }
    }

    /// Check if two ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.smallest <= other.largest && self.largest >= other.smallest
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.smallest.as_slice() <= key && key <= self.largest.as_slice()
    }

    /// Grow the range to include `key`.
    pub fn extend(&mut self, key: &[u8]) {
        if key < self.smallest.as_slice() {
            self.smallest = key.to_vec();
        }
        if key > self.largest.as_slice() {
            self.largest = key.to_vec();
        }
    }
}

/// What a flush or compaction did, as seen by the blob layer.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    /// Level the entries now live in; 0 for a flush.
    pub output_level: usize,
    /// Whether the output level is the bottom of the tree.
    pub is_last_level: bool,
    /// Smallest and largest key touched; `None` if nothing moved.
    pub range: Option<KeyRange>,
    /// Surviving entries after operand folding, in key order.
    pub entries: Vec<(Key, StoredValue)>,
    /// Tombstones removed because they reached the last level.
    pub dropped_tombstones: usize,
}

impl CompactionEvent {
    /// Entries whose value lives in a blob file.
    pub fn blob_entries(&self) -> impl Iterator<Item = (&Key, &crate::types::BlobIndex)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.blob_index().map(|idx| (k, idx)))
    }
}

/// Move the given keys into `output_level`.
///
/// ## Algorithm
/// 1. Fold pending merge operands into each entry
/// 2. Remove tombstones if the output is the last level
/// 3. Stamp the output level on every survivor
pub fn compact_keys(
    table: &mut MemTable,
    keys: Vec<Key>,
    output_level: usize,
    last_level: usize,
) -> CompactionEvent {
    let is_last_level = output_level >= last_level;
    let mut range: Option<KeyRange> = None;
    let mut entries = Vec::with_capacity(keys.len());
    let mut dropped_tombstones = 0;

    for key in keys {
        match &mut range {
            Some(r) => r.extend(&key),
            None => range = Some(KeyRange::new(key.clone(), key.clone())),
        }
        let Some(entry) = table.entry_mut(&key) else {
            continue;
        };
        entry.fold();
        match entry.value.clone() {
            Some(value) => {
                entry.level = Some(output_level as u8);
                entries.push((key, value));
            }
            None if is_last_level => {
                table.remove(&key);
                dropped_tombstones += 1;
            }
            None => entry.level = Some(output_level as u8),
        }
    }

    CompactionEvent {
        output_level,
        is_last_level,
        range,
        entries,
        dropped_tombstones,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlobIndex, MergeOperand};

    #[test]
    fn test_key_range_overlap() {
        let r1 = KeyRange::new(b"a".to_vec(), b"m".to_vec());
        let r2 = KeyRange::new(b"k".to_vec(), b"z".to_vec());
        let r3 = KeyRange::new(b"n".to_vec(), b"z".to_vec());

        assert!(r1.overlaps(&r2)); // a..m overlaps k..z
        assert!(!r1.overlaps(&r3)); // a..m doesn't overlap n..z
        assert!(r2.overlaps(&r3));
        assert!(r1.contains(b"m"));
        assert!(!r1.contains(b"n"));
    }

    #[test]
    fn test_compaction_sets_level_and_reports_entries() {
        let mut table = MemTable::new();
        table.insert(b"a".to_vec(), StoredValue::Inline(b"1".to_vec()));
        table.insert(b"b".to_vec(), StoredValue::Inline(b"2".to_vec()));
        let keys = table.keys_in_range(None, None);
        let event = compact_keys(&mut table, keys, 3, 6);

        assert_eq!(event.output_level, 3);
        assert!(!event.is_last_level);
        assert_eq!(event.entries.len(), 2);
        assert_eq!(event.range, Some(KeyRange::new(b"a".to_vec(), b"b".to_vec())));
        assert_eq!(table.entry(b"a").unwrap().level, Some(3));
    }

    #[test]
    fn test_tombstones_dropped_at_last_level_only() {
        let mut table = MemTable::new();
        table.insert(b"a".to_vec(), StoredValue::Inline(b"1".to_vec()));
        table.delete(b"a".to_vec());

        let event = compact_keys(&mut table, vec![b"a".to_vec()], 2, 6);
        assert_eq!(event.dropped_tombstones, 0);
        assert!(table.contains_key(b"a"));

        let event = compact_keys(&mut table, vec![b"a".to_vec()], 6, 6);
        assert_eq!(event.dropped_tombstones, 1);
        assert!(!table.contains_key(b"a"));
        assert!(event.entries.is_empty());
    }

    #[test]
    fn test_compaction_folds_operands() {
        let old = BlobIndex {
            file_number: 1,
            offset: 0,
            size: 10,
        };
        let mut table = MemTable::new();
        table.insert(b"k".to_vec(), StoredValue::Blob(old));
        table.merge(
            b"k",
            MergeOperand {
                expected: old,
                replacement: StoredValue::Inline(b"v".to_vec()),
                generation: 1,
            },
        );
        let event = compact_keys(&mut table, vec![b"k".to_vec()], 1, 6);
        assert_eq!(event.entries[0].1, StoredValue::Inline(b"v".to_vec()));
        assert!(table.entry(b"k").unwrap().operands.is_empty());
        assert_eq!(event.blob_entries().count(), 0);
    }
}
