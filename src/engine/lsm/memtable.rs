//! LETHE - MemTable (In-Memory Sorted Map)
//! Sorted state of the LSM stand-in. Every key remembers the level it was
//! last compacted into so blob coordinators can react to compactions.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::types::{Key, MergeOperand, StoredValue};

/// One key's state inside the LSM-tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseEntry {
    /// `None` is a tombstone.
    pub value: Option<StoredValue>,
    /// Unfolded GC merge operands, oldest first.
    pub operands: Vec<MergeOperand>,
    /// `None` until the key has been flushed.
    pub level: Option<u8>,
}

impl BaseEntry {
    /// Value as seen by readers: base value with all operands folded in.
    pub fn effective(&self) -> Option<StoredValue> {
        self.operands
            .iter()
            .fold(self.value.clone(), |current, op| op.apply(current))
    }

    /// Fold operands permanently, as compaction does.
    pub fn fold(&mut self) {
        if !self.operands.is_empty() {
            self.value = self.effective();
            self.operands.clear();
        }
    }
}

/// In-memory sorted key-value store backed by a BTreeMap.
pub struct MemTable {
    entries: BTreeMap<Key, BaseEntry>,
    /// Approximate size in bytes of keys and stored values.
    size_bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    pub fn from_entries(entries: BTreeMap<Key, BaseEntry>) -> Self {
        let size_bytes = entries
            .iter()
            .map(|(k, e)| Self::entry_size(k, e))
            .sum();
        Self {
            entries,
            size_bytes,
        }
    }

    fn entry_size(key: &[u8], entry: &BaseEntry) -> usize {
        key.len() + entry.value.as_ref().map_or(0, StoredValue::encoded_len)
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Number of keys with a live value.
    pub fn live_len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.effective().is_some())
            .count()
    }

    /// Store a value, returning the previous effective value.
    pub fn insert(&mut self, key: Key, value: StoredValue) -> Option<StoredValue> {
        self.replace(key, Some(value))
    }

    /// Insert a tombstone, returning the previous effective value.
    pub fn delete(&mut self, key: Key) -> Option<StoredValue> {
        self.replace(key, None)
    }

    fn replace(&mut self, key: Key, value: Option<StoredValue>) -> Option<StoredValue> {
        let new_size = key.len() + value.as_ref().map_or(0, StoredValue::encoded_len);
        let old_size = self
            .entries
            .get(&key)
            .map_or(0, |e| Self::entry_size(&key, e));
        let entry = self.entries.entry(key).or_default();
        let previous = entry.effective();
        entry.value = value;
        entry.operands.clear();
        // Overwritten keys go back to the memtable until the next flush.
        entry.level = None;
        self.size_bytes = self.size_bytes.saturating_sub(old_size) + new_size;
        previous
    }

    /// Queue a merge operand; ignored if the key has never been written.
    pub fn merge(&mut self, key: &[u8], operand: MergeOperand) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.operands.push(operand);
        }
    }

    /// Get the effective value of a key. Tombstones read as `None`.
    pub fn get(&self, key: &[u8]) -> Option<StoredValue> {
        self.entries.get(key).and_then(BaseEntry::effective)
    }

    #[cfg(test)]
    pub fn entry(&self, key: &[u8]) -> Option<&BaseEntry> {
        self.entries.get(key)
    }

    pub(crate) fn entry_mut(&mut self, key: &[u8]) -> Option<&mut BaseEntry> {
        self.entries.get_mut(key)
    }

    /// Check if a key exists (including tombstones).
    #[cfg(test)]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.remove(key) {
            self.size_bytes = self.size_bytes.saturating_sub(Self::entry_size(key, &entry));
        }
    }

    /// Keys in `[start, end]`; `None` bounds are open.
    pub fn keys_in_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Key> {
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Included);
        self.entries
            .range::<[u8], _>((lower, upper))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Iterate over every effective live value in key order.
    pub fn live_entries(&self) -> impl Iterator<Item = (&Key, StoredValue)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.effective().map(|v| (k, v)))
    }

    pub fn entries(&self) -> &BTreeMap<Key, BaseEntry> {
        &self.entries
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlobIndex;

    fn blob(file_number: u64) -> StoredValue {
        StoredValue::Blob(BlobIndex {
            file_number,
            offset: 16,
            size: 100,
        })
    }

    #[test]
    fn test_insert_returns_previous() {
        let mut table = MemTable::new();
        assert_eq!(table.insert(b"k".to_vec(), blob(1)), None);
        assert_eq!(table.insert(b"k".to_vec(), blob(2)), Some(blob(1)));
        assert_eq!(table.get(b"k"), Some(blob(2)));
    }

    #[test]
    fn test_delete_tombstone() {
        let mut table = MemTable::new();
        table.insert(b"key".to_vec(), StoredValue::Inline(b"v".to_vec()));
        let old = table.delete(b"key".to_vec());
        assert_eq!(old, Some(StoredValue::Inline(b"v".to_vec())));
        assert_eq!(table.get(b"key"), None);
        assert!(table.contains_key(b"key")); // tombstone still exists
        assert_eq!(table.live_len(), 0);
    }

    #[test]
    fn test_merge_operand_folds_on_read() {
        let mut table = MemTable::new();
        table.insert(b"k".to_vec(), blob(1));
        table.merge(
            b"k",
            MergeOperand {
                expected: *blob(1).blob_index().unwrap(),
                replacement: blob(5),
                generation: 1,
            },
        );
        assert_eq!(table.get(b"k"), Some(blob(5)));
        assert_eq!(table.entry(b"k").unwrap().operands.len(), 1);
        table.entry_mut(b"k").unwrap().fold();
        assert_eq!(table.entry(b"k").unwrap().value, Some(blob(5)));
        assert!(table.entry(b"k").unwrap().operands.is_empty());
    }

    #[test]
    fn test_overwrite_discards_pending_operands() {
        let mut table = MemTable::new();
        table.insert(b"k".to_vec(), blob(1));
        table.merge(
            b"k",
            MergeOperand {
                expected: *blob(1).blob_index().unwrap(),
                replacement: blob(5),
                generation: 1,
            },
        );
        let previous = table.insert(b"k".to_vec(), blob(7));
        assert_eq!(previous, Some(blob(5)));
        assert_eq!(table.get(b"k"), Some(blob(7)));
    }

    #[test]
    fn test_keys_in_range_inclusive() {
        let mut table = MemTable::new();
        for k in [b"a", b"b", b"c", b"d"] {
            table.insert(k.to_vec(), StoredValue::Inline(vec![1]));
        }
        let keys = table.keys_in_range(Some(b"b"), Some(b"c"));
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(table.keys_in_range(None, None).len(), 4);
    }

    #[test]
    fn test_size_tracking() {
        let mut table = MemTable::new();
        assert_eq!(table.size(), 0);
        table.insert(b"abc".to_vec(), StoredValue::Inline(b"12345".to_vec())); // 3 + 5
        assert_eq!(table.size(), 8);
        table.remove(b"abc");
        assert_eq!(table.size(), 0);
    }
}
