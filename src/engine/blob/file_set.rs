//! LETHE - Blob File Set
//! Catalog of every blob file the engine knows about.
//!
//! ## Lifetime
//! A file moves `Normal -> BeingGc -> Obsolete{epoch}` (or straight to
//! obsolete once its live bytes drop to zero). The reaper deletes an
//! obsolete file only when:
//! 1. the catalog holds the only `Arc` to its handle, and
//! 2. no reader pinned an epoch at or before the one it was obsoleted in.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::builder::{BlobFileBuilder, SealedFile};
use super::epoch::{EpochGuard, EpochTracker};
use super::manifest::{Manifest, ManifestEdit};
use super::meta::{BlobFileHandle, BlobFileMeta, FileState};
use crate::engine::lsm::compaction::KeyRange;
use crate::engine::metrics::EngineMetrics;
use crate::error::Result;
use crate::types::{BlobIndex, CompressionType, FileNumber};

const BLOB_EXTENSION: &str = "blob";

/// Point-in-time view of one blob file.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobFileStats {
    pub file_number: FileNumber,
    pub level: usize,
    pub sealed: bool,
    pub file_size: u64,
    pub data_bytes: u64,
    pub live_bytes: u64,
    pub discardable_ratio: f64,
    pub sampled_ratio: Option<f64>,
    pub state: FileState,
    pub marked_for_merge: bool,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub deleted: usize,
    pub failed: usize,
    /// Obsolete files still referenced or pinned.
    pub waiting: usize,
}

pub struct BlobFileSet {
    dir: PathBuf,
    files: RwLock<BTreeMap<FileNumber, Arc<BlobFileHandle>>>,
    next_file_number: AtomicU64,
    epochs: EpochTracker,
    manifest: Mutex<Manifest>,
    metrics: Arc<EngineMetrics>,
}

impl BlobFileSet {
    /// Rebuild the catalog from the manifest in `dir`.
    ///
    /// Unsealed files left by a crash are recovered and sealed, and `.blob`
    /// files the manifest never mentions are deleted.
    pub fn open(dir: &Path, sync: bool, metrics: Arc<EngineMetrics>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let (mut manifest, state) = Manifest::open(dir, sync)?;

        let mut files = BTreeMap::new();
        for (number, (mut meta, obsolete)) in state.files {
            let path = blob_path(dir, number);
            if !path.exists() {
                if meta.sealed || obsolete {
                    log::error!("blob file {} is in the manifest but missing on disk", number);
                } else {
                    log::info!("blob file {} was registered but never written", number);
                }
                manifest.append(&ManifestEdit::DeleteFile(number))?;
                continue;
            }
            if !meta.sealed {
                let sealed = BlobFileBuilder::recover_unsealed(&path, number)?;
                log::warn!(
                    "recovered unsealed blob file {} ({} records)",
                    number,
                    sealed.record_count
                );
                meta.apply_seal(&sealed);
                manifest.append(&ManifestEdit::SealFile(meta.clone()))?;
            }
            let handle = BlobFileHandle::new(path, meta);
            if obsolete {
                handle.mark_obsolete(0);
            }
            files.insert(number, Arc::new(handle));
        }

        remove_orphans(dir, &files)?;

        log::info!(
            "blob file set opened at {:?} ({} files, next file number {})",
            dir,
            files.len(),
            state.max_file_number + 1
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            files: RwLock::new(files),
            next_file_number: AtomicU64::new(state.max_file_number + 1),
            epochs: EpochTracker::new(),
            manifest: Mutex::new(manifest),
            metrics,
        })
    }

    pub fn new_file_number(&self) -> FileNumber {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn file_path(&self, number: FileNumber) -> PathBuf {
        blob_path(&self.dir, number)
    }

    /// Register a file about to be written at `level`. The manifest learns
    /// about it before the file exists on disk.
    pub fn register_new(
        &self,
        level: usize,
        compression: CompressionType,
    ) -> Result<Arc<BlobFileHandle>> {
        let number = self.new_file_number();
        let meta = BlobFileMeta::new(number, level, number, compression);
        self.manifest.lock().append(&ManifestEdit::AddFile(meta.clone()))?;
        let handle = Arc::new(BlobFileHandle::new(self.file_path(number), meta));
        self.files.write().insert(number, Arc::clone(&handle));
        EngineMetrics::add(&self.metrics.blob_files_created, 1);
        Ok(handle)
    }

    /// Record that a registered file has been sealed. A `Normal` file that
    /// no key references any more becomes obsolete right away.
    pub fn seal(&self, handle: &Arc<BlobFileHandle>, sealed: &SealedFile) -> Result<()> {
        handle.seal(sealed);
        self.manifest
            .lock()
            .append(&ManifestEdit::SealFile(handle.meta()))?;
        if handle.live_bytes() == 0 && handle.state() == FileState::Normal {
            self.mark_obsolete(handle)?;
        }
        Ok(())
    }

    /// Delete a file no key was ever pointed at, e.g. an aborted GC output.
    pub fn drop_file(&self, number: FileNumber) -> Result<()> {
        self.files.write().remove(&number);
        match fs::remove_file(self.file_path(number)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.manifest.lock().append(&ManifestEdit::DeleteFile(number))
    }

    pub fn get(&self, number: FileNumber) -> Option<Arc<BlobFileHandle>> {
        self.files.read().get(&number).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every file that is not obsolete.
    pub fn live_files(&self) -> Vec<Arc<BlobFileHandle>> {
        self.files
            .read()
            .values()
            .filter(|h| !h.is_obsolete())
            .cloned()
            .collect()
    }

    /// Sealed files no batch has claimed.
    pub fn gc_candidates(&self) -> Vec<Arc<BlobFileHandle>> {
        self.files
            .read()
            .values()
            .filter(|h| h.is_sealed() && h.state() == FileState::Normal)
            .cloned()
            .collect()
    }

    /// Live sealed files at `min_level` or deeper overlapping `range`, or
    /// all of them when `range` is `None`.
    pub fn sorted_runs(
        &self,
        range: Option<&KeyRange>,
        min_level: usize,
    ) -> Vec<Arc<BlobFileHandle>> {
        self.files
            .read()
            .values()
            .filter(|h| h.is_sealed() && !h.is_obsolete() && h.level() >= min_level)
            .filter(|h| match (h.range(), range) {
                (Some(r), Some(q)) => r.overlaps(q),
                (Some(_), None) => true,
                (None, _) => false,
            })
            .cloned()
            .collect()
    }

    pub fn credit(&self, index: &BlobIndex) {
        if let Some(handle) = self.get(index.file_number) {
            handle.credit(index.size);
        }
    }

    /// A key stopped pointing at `index`.
    pub fn debit(&self, index: &BlobIndex) -> Result<()> {
        let Some(handle) = self.get(index.file_number) else {
            return Ok(());
        };
        let remaining = handle.debit(index.size);
        if remaining == 0 && handle.is_sealed() && handle.state() == FileState::Normal {
            self.mark_obsolete(&handle)?;
        }
        Ok(())
    }

    /// Obsolete `handle` at a fresh epoch. Returns false if it already was.
    pub fn mark_obsolete(&self, handle: &BlobFileHandle) -> Result<bool> {
        let epoch = self.epochs.advance();
        if !handle.mark_obsolete(epoch) {
            return Ok(false);
        }
        self.manifest
            .lock()
            .append(&ManifestEdit::ObsoleteFile(handle.file_number()))?;
        EngineMetrics::add(&self.metrics.files_obsoleted, 1);
        log::debug!("blob file {} obsolete at epoch {}", handle.file_number(), epoch);
        Ok(true)
    }

    /// Pin the read epoch; hold the guard across index lookup and blob read.
    pub fn pin(&self) -> EpochGuard<'_> {
        self.epochs.pin()
    }

    /// Delete every obsolete file nothing references any more.
    pub fn purge_obsolete(&self) -> Result<PurgeStats> {
        let mut stats = PurgeStats::default();
        let victims: Vec<Arc<BlobFileHandle>> = {
            let mut files = self.files.write();
            let ready: Vec<FileNumber> = files
                .iter()
                .filter_map(|(number, handle)| match handle.state() {
                    FileState::Obsolete { epoch } => {
                        if Arc::strong_count(handle) == 1 && self.epochs.is_reclaimable(epoch) {
                            Some(*number)
                        } else {
                            stats.waiting += 1;
                            None
                        }
                    }
                    _ => None,
                })
                .collect();
            ready.iter().filter_map(|n| files.remove(n)).collect()
        };

        for handle in victims {
            let number = handle.file_number();
            match fs::remove_file(handle.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("failed to delete obsolete blob file {}: {}", number, e);
                    EngineMetrics::add(&self.metrics.reap_failures, 1);
                    stats.failed += 1;
                    self.files.write().insert(number, handle);
                    continue;
                }
            }
            self.manifest.lock().append(&ManifestEdit::DeleteFile(number))?;
            EngineMetrics::add(&self.metrics.files_reaped, 1);
            log::info!("deleted obsolete blob file {}", number);
            stats.deleted += 1;
        }
        Ok(stats)
    }

    /// Reset live bytes from a full index scan, done once at open.
    ///
    /// Sealed files nothing points at become obsolete; an obsolete file that
    /// is still referenced is revived.
    pub fn rebuild_live_bytes(&self, live: &HashMap<FileNumber, u64>) -> Result<()> {
        let handles: Vec<Arc<BlobFileHandle>> = self.files.read().values().cloned().collect();
        for handle in handles {
            let number = handle.file_number();
            let bytes = live.get(&number).copied().unwrap_or(0);
            handle.set_live_bytes(bytes);
            if bytes > 0 && handle.is_obsolete() {
                log::warn!("blob file {} was obsolete but is still referenced; reviving", number);
                handle.revive();
                self.manifest
                    .lock()
                    .append(&ManifestEdit::AddFile(handle.meta()))?;
            } else if bytes == 0 && handle.is_sealed() {
                self.mark_obsolete(&handle)?;
            }
        }
        for number in live.keys() {
            if !self.files.read().contains_key(number) {
                log::error!("index references missing blob file {}", number);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<BlobFileStats> {
        self.files
            .read()
            .values()
            .map(|h| BlobFileStats {
                file_number: h.file_number(),
                level: h.level(),
                sealed: h.is_sealed(),
                file_size: h.file_size(),
                data_bytes: h.data_bytes(),
                live_bytes: h.live_bytes(),
                discardable_ratio: h.discardable_ratio(),
                sampled_ratio: h.sampled_ratio(),
                state: h.state(),
                marked_for_merge: h.is_marked_for_merge(),
            })
            .collect()
    }
}

fn blob_path(dir: &Path, number: FileNumber) -> PathBuf {
    dir.join(format!("{:06}.{}", number, BLOB_EXTENSION))
}

fn remove_orphans(dir: &Path, known: &BTreeMap<FileNumber, Arc<BlobFileHandle>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<FileNumber>().ok());
        match number {
            Some(n) if known.contains_key(&n) => {}
            _ => {
                log::warn!("removing orphan blob file {:?}", path);
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}
