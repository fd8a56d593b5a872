//! LETHE - Blob file metadata and lifecycle state

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::builder::SealedFile;
use super::reader::BlobFileReader;
use crate::engine::lsm::compaction::KeyRange;
use crate::error::Result;
use crate::types::{BlobIndex, CompressionType, FileNumber, Value};

/// Persistent description of a blob file, as written to the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobFileMeta {
    pub file_number: FileNumber,
    /// Sorted-run level; 0 holds the newest foreground files.
    pub level: u8,
    pub creation_sequence: u64,
    pub compression: CompressionType,
    pub sealed: bool,
    pub file_size: u64,
    pub data_bytes: u64,
    pub record_count: u64,
    pub range: Option<KeyRange>,
    pub has_dictionary: bool,
}

impl BlobFileMeta {
    pub fn new(
        file_number: FileNumber,
        level: usize,
        creation_sequence: u64,
        compression: CompressionType,
    ) -> Self {
        Self {
            file_number,
            level: level as u8,
            creation_sequence,
            compression,
            sealed: false,
            file_size: 0,
            data_bytes: 0,
            record_count: 0,
            range: None,
            has_dictionary: false,
        }
    }

    pub fn apply_seal(&mut self, sealed: &SealedFile) {
        self.sealed = true;
        self.file_size = sealed.file_size;
        self.data_bytes = sealed.data_bytes;
        self.record_count = sealed.record_count;
        self.range = sealed.range.clone();
        self.has_dictionary = sealed.has_dictionary;
    }
}

/// GC lifecycle of a blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Normal,
    /// Claimed by exactly one GC batch or merge.
    BeingGc,
    /// Superseded at `epoch`; waiting for the reaper.
    Obsolete { epoch: u64 },
}

/// Shared, reference-counted view of one blob file.
///
/// The catalog holds one `Arc`; every reader and GC batch holds another for
/// as long as it uses the file, which keeps the reaper away.
pub struct BlobFileHandle {
    path: PathBuf,
    meta: RwLock<BlobFileMeta>,
    state: Mutex<FileState>,
    live_bytes: AtomicU64,
    /// Record bytes appended so far; fixed once sealed.
    data_bytes: AtomicU64,
    marked_for_merge: AtomicBool,
    sampled_ratio: Mutex<Option<f64>>,
    reader: RwLock<Option<Arc<BlobFileReader>>>,
}

impl BlobFileHandle {
    pub fn new(path: PathBuf, meta: BlobFileMeta) -> Self {
        let data_bytes = meta.data_bytes;
        Self {
            path,
            meta: RwLock::new(meta),
            state: Mutex::new(FileState::Normal),
            live_bytes: AtomicU64::new(0),
            data_bytes: AtomicU64::new(data_bytes),
            marked_for_merge: AtomicBool::new(false),
            sampled_ratio: Mutex::new(None),
            reader: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_number(&self) -> FileNumber {
        self.meta.read().file_number
    }

    pub fn meta(&self) -> BlobFileMeta {
        self.meta.read().clone()
    }

    pub fn level(&self) -> usize {
        self.meta.read().level as usize
    }

    pub fn creation_sequence(&self) -> u64 {
        self.meta.read().creation_sequence
    }

    pub fn is_sealed(&self) -> bool {
        self.meta.read().sealed
    }

    pub fn file_size(&self) -> u64 {
        let meta = self.meta.read();
        if meta.sealed {
            meta.file_size
        } else {
            self.data_bytes.load(Ordering::Acquire) + super::format::HEADER_SIZE
        }
    }

    pub fn range(&self) -> Option<KeyRange> {
        self.meta.read().range.clone()
    }

    pub(crate) fn seal(&self, sealed: &SealedFile) {
        self.meta.write().apply_seal(sealed);
        self.data_bytes.store(sealed.data_bytes, Ordering::Release);
        // Reopen so the reader picks up the offset index.
        *self.reader.write() = None;
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_data_bytes(&self, bytes: u64) {
        self.data_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn set_live_bytes(&self, bytes: u64) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    pub(crate) fn credit(&self, bytes: u64) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Subtract superseded bytes and return what remains live.
    pub(crate) fn debit(&self, bytes: u64) -> u64 {
        let mut current = self.live_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.live_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes no longer referenced by any live key, from live accounting.
    pub fn discardable_bytes(&self) -> u64 {
        self.data_bytes().saturating_sub(self.live_bytes())
    }

    /// Fraction of record bytes that are garbage, from live accounting.
    pub fn discardable_ratio(&self) -> f64 {
        let data = self.data_bytes();
        if data == 0 {
            return 0.0;
        }
        self.discardable_bytes() as f64 / data as f64
    }

    /// Most recent Sampler estimate, if any.
    pub fn sampled_ratio(&self) -> Option<f64> {
        *self.sampled_ratio.lock()
    }

    pub(crate) fn set_sampled_ratio(&self, ratio: f64) {
        *self.sampled_ratio.lock() = Some(ratio);
    }

    pub fn state(&self) -> FileState {
        *self.state.lock()
    }

    pub fn is_obsolete(&self) -> bool {
        matches!(self.state(), FileState::Obsolete { .. })
    }

    /// Take exclusive GC ownership; fails if another batch holds it or the
    /// file is obsolete.
    pub(crate) fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if *state == FileState::Normal {
            *state = FileState::BeingGc;
            true
        } else {
            false
        }
    }

    /// Give a claimed file back untouched.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if *state == FileState::BeingGc {
            *state = FileState::Normal;
        }
    }

    /// Transition to obsolete; false if it already was.
    pub(crate) fn mark_obsolete(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, FileState::Obsolete { .. }) {
            return false;
        }
        *state = FileState::Obsolete { epoch };
        true
    }

    /// Undo an obsolete mark found to be wrong during recovery.
    pub(crate) fn revive(&self) {
        *self.state.lock() = FileState::Normal;
    }

    pub fn is_marked_for_merge(&self) -> bool {
        self.marked_for_merge.load(Ordering::Acquire)
    }

    pub(crate) fn mark_for_merge(&self) -> bool {
        !self.marked_for_merge.swap(true, Ordering::AcqRel)
    }

    /// Shared reader, opened on first use.
    pub fn reader(&self) -> Result<Arc<BlobFileReader>> {
        if let Some(reader) = self.reader.read().as_ref() {
            return Ok(Arc::clone(reader));
        }
        let mut slot = self.reader.write();
        if let Some(reader) = slot.as_ref() {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(BlobFileReader::open(&self.path, self.file_number())?);
        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    pub fn get(&self, key: &[u8], index: &BlobIndex) -> Result<Value> {
        self.reader()?.get(key, index)
    }
}

impl std::fmt::Debug for BlobFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobFileHandle")
            .field("file_number", &self.file_number())
            .field("level", &self.level())
            .field("state", &self.state())
            .field("live_bytes", &self.live_bytes())
            .field("data_bytes", &self.data_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> BlobFileHandle {
        let mut meta = BlobFileMeta::new(5, 0, 5, CompressionType::None);
        meta.sealed = true;
        meta.data_bytes = 1000;
        BlobFileHandle::new(PathBuf::from("000005.blob"), meta)
    }

    #[test]
    fn test_discardable_ratio_from_live_bytes() {
        let h = handle();
        h.set_live_bytes(1000);
        assert_eq!(h.discardable_ratio(), 0.0);
        assert_eq!(h.debit(600), 400);
        assert!((h.discardable_ratio() - 0.6).abs() < 1e-9);
        assert_eq!(h.debit(5000), 0);
        assert_eq!(h.discardable_ratio(), 1.0);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let h = handle();
        assert!(h.try_claim());
        assert!(!h.try_claim());
        h.release();
        assert!(h.try_claim());
    }

    #[test]
    fn test_obsolete_file_cannot_be_claimed() {
        let h = handle();
        assert!(h.mark_obsolete(3));
        assert!(!h.mark_obsolete(4));
        assert_eq!(h.state(), FileState::Obsolete { epoch: 3 });
        assert!(!h.try_claim());
        h.release();
        assert!(h.is_obsolete());
    }

    #[test]
    fn test_mark_for_merge_reports_first_mark() {
        let h = handle();
        assert!(h.mark_for_merge());
        assert!(!h.mark_for_merge());
        assert!(h.is_marked_for_merge());
    }
}
