//! LETHE - LSM-tree stand-in
//!
//! The blob layer treats the LSM-tree as an external collaborator: it looks
//! up the current value of a key, writes index rewrites back, and listens to
//! flush and compaction events. [`BaseDb`] is a small in-process tree that
//! honours exactly that contract: a sorted table guarded by one lock, a WAL,
//! and a checkpoint written whenever levels change.

pub mod compaction;
pub mod memtable;
pub mod wal;

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{BlobIndex, Key, MergeOperand, StoredValue};

use self::compaction::{compact_keys, CompactionEvent};
use self::memtable::MemTable;
use self::wal::WriteAheadLog;

/// Key lookups used for the live/dead test of blob records.
pub trait IndexProbe: Send + Sync {
    /// Current effective value of `key`.
    fn current(&self, key: &[u8]) -> Option<StoredValue>;

    /// Whether `key` still points at exactly this blob record.
    fn is_live(&self, key: &[u8], index: &BlobIndex) -> bool {
        matches!(self.current(key), Some(StoredValue::Blob(current)) if current == *index)
    }
}

/// How a rewrite reaches the LSM-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// Check the current value and overwrite it under the write lock.
    CompareAndSet,
    /// Append a merge operand carrying the expected index.
    MergeOperand { generation: u64 },
}

struct BaseState {
    table: MemTable,
    wal: WriteAheadLog,
}

/// Minimal leveled key-value store underneath the blob layer.
pub struct BaseDb {
    state: RwLock<BaseState>,
    checkpoint_path: PathBuf,
    last_level: usize,
}

impl BaseDb {
    /// Open the tree: load the checkpoint, then replay the WAL on top.
    pub fn open(dir: &Path, sync_writes: bool, num_levels: usize) -> Result<Self> {
        let checkpoint_path = dir.join("base.checkpoint");
        let wal_path = dir.join("base.wal");

        let mut table = wal::read_checkpoint(&checkpoint_path)?;
        let replayed = WriteAheadLog::replay(&wal_path, &mut table)?;
        let wal = WriteAheadLog::open(wal_path, sync_writes)?;

        log::info!(
            "LSM opened at {:?} ({} keys, {} WAL records replayed)",
            dir,
            table.live_len(),
            replayed
        );

        Ok(Self {
            state: RwLock::new(BaseState { table, wal }),
            checkpoint_path,
            last_level: num_levels - 1,
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<StoredValue> {
        self.state.read().table.get(key)
    }

    /// Write a value, returning the value it replaced.
    pub fn put(&self, key: Key, value: StoredValue) -> Result<Option<StoredValue>> {
        let mut state = self.state.write();
        state.wal.append_put(&key, &value)?;
        Ok(state.table.insert(key, value))
    }

    /// Write a tombstone, returning the value it replaced.
    pub fn delete(&self, key: Key) -> Result<Option<StoredValue>> {
        let mut state = self.state.write();
        state.wal.append_delete(&key)?;
        Ok(state.table.delete(key))
    }

    /// Point `key` away from `expected`, if it still points there.
    ///
    /// Returns whether the rewrite took effect. A key that was overwritten or
    /// deleted since `expected` was read is left alone.
    pub fn rewrite(
        &self,
        key: &[u8],
        expected: &BlobIndex,
        replacement: StoredValue,
        mode: RewriteMode,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let current = state.table.get(key);
        if current != Some(StoredValue::Blob(*expected)) {
            return Ok(false);
        }
        match mode {
            RewriteMode::CompareAndSet => {
                state.wal.append_put(key, &replacement)?;
                if let Some(entry) = state.table.entry_mut(key) {
                    // Keep the level: a rewrite does not move the key.
                    entry.fold();
                    entry.value = Some(replacement);
                }
            }
            RewriteMode::MergeOperand { generation } => {
                let operand = MergeOperand {
                    expected: *expected,
                    replacement,
                    generation,
                };
                state.wal.append_merge(key, &operand)?;
                state.table.merge(key, operand);
            }
        }
        Ok(true)
    }

    /// Move unflushed keys to level 0 and checkpoint.
    pub fn flush(&self) -> Result<CompactionEvent> {
        let mut state = self.state.write();
        let keys: Vec<Key> = state
            .table
            .entries()
            .iter()
            .filter(|(_, e)| e.level.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        let event = compact_keys(&mut state.table, keys, 0, self.last_level);
        self.checkpoint(&mut state)?;
        Ok(event)
    }

    /// Compact every key in `[start, end]` into `output_level`.
    pub fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        output_level: usize,
    ) -> Result<CompactionEvent> {
        let output_level = output_level.min(self.last_level);
        let mut state = self.state.write();
        let keys = state.table.keys_in_range(start, end);
        let event = compact_keys(&mut state.table, keys, output_level, self.last_level);
        self.checkpoint(&mut state)?;
        Ok(event)
    }

    fn checkpoint(&self, state: &mut BaseState) -> Result<()> {
        wal::write_checkpoint(&self.checkpoint_path, &state.table)?;
        state.wal.truncate()
    }

    /// Snapshot of every live key and its stored value, in key order.
    pub fn scan(&self) -> Vec<(Key, StoredValue)> {
        self.state
            .read()
            .table
            .live_entries()
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }

    /// Visit every live blob index.
    pub fn for_each_blob_index(&self, mut f: impl FnMut(&[u8], &BlobIndex)) {
        let state = self.state.read();
        for (key, value) in state.table.live_entries() {
            if let StoredValue::Blob(index) = value {
                f(key, &index);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().table.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory size of the table.
    pub fn size(&self) -> usize {
        self.state.read().table.size()
    }

    pub fn last_level(&self) -> usize {
        self.last_level
    }
}

impl IndexProbe for BaseDb {
    fn current(&self, key: &[u8]) -> Option<StoredValue> {
        self.get(key)
    }
}
