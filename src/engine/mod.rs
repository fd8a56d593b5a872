//! LETHE - Storage Engine Module
//! Top-level module tying the LSM-tree, blob storage and background work
//! together.
//!
//! ## Write path
//! [`ValueRouter`] (inline or blob file) -> LSM-tree put -> debit whatever
//! value the put replaced.
//!
//! ## Read path
//! Pin an epoch -> LSM lookup -> blob read through a referenced handle.

pub mod blob;
pub mod gc;
pub mod level_merge;
pub mod lsm;
pub mod metrics;
pub mod range_merge;
pub mod reaper;
pub mod rewrite;
pub mod router;
pub mod run_mode;
pub mod sampler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{LetheError, Result};
use crate::types::{BlobIndex, FileNumber, Key, RunMode, StoredValue, Value};

use self::blob::{BlobFileHandle, BlobFileSet, BlobFileStats, PurgeStats};
use self::gc::{GcOutcome, GcScheduler};
use self::lsm::compaction::{CompactionEvent, KeyRange};
use self::lsm::BaseDb;
use self::metrics::EngineMetrics;
use self::reaper::ObsoleteFileReaper;
use self::rewrite::RewriteTarget;
use self::router::ValueRouter;
use self::run_mode::RunModeController;
use self::sampler::Sampler;

/// State shared between the foreground handle and background threads.
pub struct EngineCore {
    pub(crate) config: Config,
    pub(crate) base: BaseDb,
    pub(crate) files: Arc<BlobFileSet>,
    pub(crate) router: ValueRouter,
    pub(crate) run_mode: RunModeController,
    pub(crate) sampler: Sampler,
    pub(crate) metrics: Arc<EngineMetrics>,
    gc_generation: AtomicU64,
}

impl EngineCore {
    pub(crate) fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let metrics = Arc::new(EngineMetrics::new());

        let base = BaseDb::open(config.data_dir(), config.sync_writes(), config.num_levels())?;
        let files = Arc::new(BlobFileSet::open(
            config.blob_dir(),
            config.sync_writes(),
            Arc::clone(&metrics),
        )?);

        let mut live: HashMap<FileNumber, u64> = HashMap::new();
        base.for_each_blob_index(|_, index| {
            *live.entry(index.file_number).or_insert(0) += index.size;
        });
        files.rebuild_live_bytes(&live)?;

        let router = ValueRouter::new(&config, Arc::clone(&files));
        let run_mode = RunModeController::new(config.blob_run_mode());
        let sampler = Sampler::new(config.sample_file_size_ratio());

        Ok(Self {
            config,
            base,
            files,
            router,
            run_mode,
            sampler,
            metrics,
            gc_generation: AtomicU64::new(0),
        })
    }

    pub(crate) fn next_gc_generation(&self) -> u64 {
        self.gc_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn put(&self, key: Key, value: Value) -> Result<()> {
        let len = value.len();
        let stored = self.router.route(&key, value, self.run_mode.get())?;
        let new_index = stored.blob_index().copied();
        match self.base.put(key, stored) {
            Ok(replaced) => {
                self.metrics.record_put(len, new_index.is_some());
                if let Some(StoredValue::Blob(old)) = replaced {
                    self.files.debit(&old)?;
                }
                Ok(())
            }
            Err(e) => {
                // The record was written but nothing will point at it.
                if let Some(index) = new_index {
                    self.files.debit(&index)?;
                }
                Err(e)
            }
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.metrics.record_get();
        let _pin = self.files.pin();
        match self.base.get(key) {
            None => Ok(None),
            Some(StoredValue::Inline(value)) => Ok(Some(value)),
            Some(StoredValue::Blob(index)) => self.read_blob(key, &index).map(Some),
        }
    }

    pub(crate) fn delete(&self, key: Key) -> Result<()> {
        self.metrics.record_delete();
        if let Some(StoredValue::Blob(old)) = self.base.delete(key)? {
            self.files.debit(&old)?;
        }
        Ok(())
    }

    pub(crate) fn scan(&self) -> Result<Vec<(Key, Value)>> {
        let _pin = self.files.pin();
        self.base
            .scan()
            .into_iter()
            .map(|(key, stored)| {
                let value = match stored {
                    StoredValue::Inline(value) => value,
                    StoredValue::Blob(index) => self.read_blob(&key, &index)?,
                };
                Ok((key, value))
            })
            .collect()
    }

    /// Caller must hold an epoch pin.
    fn read_blob(&self, key: &[u8], index: &BlobIndex) -> Result<Value> {
        let file = self
            .files
            .get(index.file_number)
            .ok_or(LetheError::BlobFileMissing(index.file_number))?;
        file.get(key, index)
    }

    pub(crate) fn flush(&self) -> Result<CompactionEvent> {
        let _pin = self.files.pin();
        self.router.seal_active()?;
        let event = self.base.flush()?;
        EngineMetrics::add(&self.metrics.flushes, 1);
        log::debug!("flushed {} entries to L0", event.entries.len());
        self.after_compaction(&event)?;
        Ok(event)
    }

    pub(crate) fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        output_level: usize,
    ) -> Result<CompactionEvent> {
        let _pin = self.files.pin();
        let event = self.base.compact_range(start, end, output_level)?;
        EngineMetrics::add(&self.metrics.compactions, 1);
        log::debug!(
            "compacted {} entries into L{} ({} tombstones dropped)",
            event.entries.len(),
            event.output_level,
            event.dropped_tombstones
        );
        self.after_compaction(&event)?;
        Ok(event)
    }

    /// Blob-layer reaction to a flush or compaction.
    ///
    /// Fallback mode takes precedence over level merge: values it touches
    /// go back inline instead of into another blob file.
    fn after_compaction(&self, event: &CompactionEvent) -> Result<()> {
        if self.run_mode.is_fallback() {
            // An unsealed file is never obsoleted, however many values leave it.
            self.router.seal_active()?;
            let stats =
                rewrite::rewrite_entries(self, event.blob_entries(), RewriteTarget::Inline, |_| true)?;
            EngineMetrics::add(&self.metrics.fallback_records, stats.applied as u64);
            if stats.applied > 0 {
                log::info!("fallback: {} values moved back inline", stats.applied);
            }
        } else if level_merge::applies(&self.config, event) {
            level_merge::merge(self, event)?;
        }

        if self.config.range_merge() && event.is_last_level {
            if let Some(range) = &event.range {
                range_merge::check(self, range);
            }
        }
        Ok(())
    }
}

/// The Lethe storage engine.
///
/// Large values are kept in blob files and only a small index lives in the
/// LSM-tree. Background threads collect garbage and delete obsolete files.
/// All methods take `&self`; share the engine across threads with `Arc`.
pub struct Lethe {
    core: Arc<EngineCore>,
    scheduler: GcScheduler,
    reaper: Option<ObsoleteFileReaper>,
    closed: AtomicBool,
}

impl Lethe {
    /// Open or create a Lethe storage engine at the configured path.
    pub fn open(config: Config) -> Result<Self> {
        let core = Arc::new(EngineCore::open(config)?);
        let scheduler = GcScheduler::start(Arc::clone(&core))?;
        let reaper = match core.config.purge_obsolete_files_period() {
            Some(period) => Some(ObsoleteFileReaper::start(Arc::clone(&core.files), period)?),
            None => {
                log::info!("obsolete blob files will not be deleted (purge period 0)");
                None
            }
        };

        log::info!(
            "Lethe engine opened at {:?} ({} keys, {} blob files, mode {:?})",
            core.config.data_dir(),
            core.base.len(),
            core.files.len(),
            core.run_mode.get()
        );
        Ok(Self {
            core,
            scheduler,
            reaper,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LetheError::ShuttingDown);
        }
        Ok(())
    }

    /// Insert a key-value pair. Values of at least `min_blob_size` bytes go
    /// to a blob file unless the run mode forbids it.
    pub fn put(&self, key: Key, value: Value) -> Result<()> {
        self.ensure_open()?;
        self.core.put(key, value)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.core.get(key)
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        self.ensure_open()?;
        self.core.delete(key)
    }

    /// All live key-value pairs in key order.
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.core.scan()
    }

    /// What the LSM-tree stores for `key`: the value itself or a blob index.
    pub fn stored_value(&self, key: &[u8]) -> Option<StoredValue> {
        self.core.base.get(key)
    }

    pub fn len(&self) -> usize {
        self.core.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.base.is_empty()
    }

    /// Approximate in-memory size of the LSM index in bytes.
    pub fn index_size(&self) -> usize {
        self.core.base.size()
    }

    /// Seal the active blob file and move unflushed keys to level 0.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.core.flush()?;
        self.scheduler.trigger();
        Ok(())
    }

    /// Compact keys in `[start, end]` into `output_level`. `None` bounds are
    /// open.
    pub fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        output_level: usize,
    ) -> Result<()> {
        self.ensure_open()?;
        self.core.compact_range(start, end, output_level)?;
        self.scheduler.trigger();
        Ok(())
    }

    /// Run one GC cycle on the calling thread.
    pub fn run_gc(&self) -> Result<GcOutcome> {
        self.ensure_open()?;
        gc::run_cycle(&self.core)
    }

    /// Delete every obsolete file that nothing references now.
    pub fn purge_obsolete_files(&self) -> Result<PurgeStats> {
        self.core.files.purge_obsolete()
    }

    /// Switch the run mode; returns the previous one.
    pub fn set_run_mode(&self, mode: RunMode) -> RunMode {
        self.core.run_mode.set(mode)
    }

    pub fn run_mode(&self) -> RunMode {
        self.core.run_mode.get()
    }

    pub fn set_background_gc_disabled(&self, disabled: bool) {
        self.scheduler.set_disabled(disabled);
    }

    pub fn is_background_gc_disabled(&self) -> bool {
        self.scheduler.is_disabled()
    }

    pub fn blob_file_stats(&self) -> Vec<BlobFileStats> {
        self.core.files.stats()
    }

    /// Number of blob files that are not obsolete.
    pub fn live_blob_file_count(&self) -> usize {
        self.core.files.live_files().len()
    }

    /// Referenced handle to a blob file; the file is not deleted while the
    /// handle is held.
    pub fn blob_file(&self, number: FileNumber) -> Option<Arc<BlobFileHandle>> {
        self.core.files.get(number)
    }

    /// Sorted-run depth of the bottom two levels over `range`, or over the
    /// whole key space.
    pub fn sorted_run_depth(&self, range: Option<&KeyRange>) -> usize {
        range_merge::run_depth(&self.core, range)
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.core.metrics
    }

    /// Stop background work and seal the active blob file. Called on drop.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scheduler.shutdown();
        if let Some(reaper) = &self.reaper {
            reaper.stop();
        }
        self.core.router.seal_active()?;
        log::info!("Lethe engine closed");
        Ok(())
    }
}

impl Drop for Lethe {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("error while closing Lethe engine: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &std::path::Path) -> Lethe {
        let config = Config::builder(dir)
            .with_min_blob_size(100)
            .with_disable_background_gc(true)
            .with_purge_obsolete_files_period_sec(0)
            .with_sync_writes(false)
            .build()
            .unwrap();
        Lethe::open(config).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());

        engine.put(b"small".to_vec(), b"tiny".to_vec()).unwrap();
        engine.put(b"large".to_vec(), vec![5u8; 1000]).unwrap();
        assert_eq!(engine.get(b"small").unwrap(), Some(b"tiny".to_vec()));
        assert_eq!(engine.get(b"large").unwrap(), Some(vec![5u8; 1000]));
        assert!(matches!(engine.stored_value(b"large"), Some(StoredValue::Blob(_))));

        engine.delete(b"large".to_vec()).unwrap();
        assert_eq!(engine.get(b"large").unwrap(), None);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_overwrite_debits_old_blob() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), vec![1u8; 500]).unwrap();
        engine.flush().unwrap();
        let Some(StoredValue::Blob(first)) = engine.stored_value(b"k") else {
            panic!("expected a blob index");
        };

        engine.put(b"k".to_vec(), vec![2u8; 500]).unwrap();
        let file = engine.blob_file(first.file_number).unwrap();
        assert!(file.is_obsolete());
        assert_eq!(engine.get(b"k").unwrap(), Some(vec![2u8; 500]));
    }

    #[test]
    fn test_closed_engine_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.close().unwrap();
        assert!(matches!(
            engine.put(b"k".to_vec(), b"v".to_vec()),
            Err(LetheError::ShuttingDown)
        ));
    }

    #[test]
    fn test_reopen_restores_blob_values() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.put(b"a".to_vec(), vec![3u8; 300]).unwrap();
            engine.put(b"b".to_vec(), b"inline".to_vec()).unwrap();
        }
        let engine = open(dir.path());
        assert_eq!(engine.get(b"a").unwrap(), Some(vec![3u8; 300]));
        assert_eq!(engine.get(b"b").unwrap(), Some(b"inline".to_vec()));
        assert_eq!(engine.live_blob_file_count(), 1);
    }
}
