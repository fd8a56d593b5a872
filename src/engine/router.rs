//! LETHE - Value Router
//! Decides per write whether a value stays inline in the LSM-tree or is
//! separated into the active foreground blob file.

use std::sync::Arc;

use parking_lot::Mutex;

use super::blob::compression::BlobCodec;
use super::blob::{BlobFileBuilder, BlobFileHandle, BlobFileSet};
use crate::config::Config;
use crate::error::Result;
use crate::types::{BlobIndex, FileNumber, RunMode, StoredValue, Value};

/// Foreground writes always land in level 0.
const FOREGROUND_LEVEL: usize = 0;

struct ActiveFile {
    builder: BlobFileBuilder,
    handle: Arc<BlobFileHandle>,
}

pub struct ValueRouter {
    files: Arc<BlobFileSet>,
    min_blob_size: u64,
    target_file_size: u64,
    codec: BlobCodec,
    sync: bool,
    active: Mutex<Option<ActiveFile>>,
}

impl ValueRouter {
    pub fn new(config: &Config, files: Arc<BlobFileSet>) -> Self {
        Self {
            files,
            min_blob_size: config.min_blob_size(),
            target_file_size: config.blob_file_target_size(),
            codec: BlobCodec::new(
                config.blob_file_compression(),
                config.compression_options(),
            ),
            sync: config.sync_writes(),
            active: Mutex::new(None),
        }
    }

    /// Values at or above `min_blob_size` are separated, unless the run mode
    /// forbids new blob data.
    pub fn should_separate(&self, value_len: usize, mode: RunMode) -> bool {
        mode.allows_blob_writes() && value_len as u64 >= self.min_blob_size
    }

    /// Produce what the LSM-tree should store for `value`.
    ///
    /// For separated values the record is durable in the blob file before
    /// this returns, so the index can be written right after.
    pub fn route(&self, key: &[u8], value: Value, mode: RunMode) -> Result<StoredValue> {
        if !self.should_separate(value.len(), mode) {
            return Ok(StoredValue::Inline(value));
        }

        let mut active = self.active.lock();
        let mut file = match active.take() {
            Some(file) => file,
            None => self.open_file()?,
        };
        let index = match file.builder.add(key, &value) {
            Ok(index) => index,
            Err(e) => {
                // Retire the file unsealed; the next open recovers its
                // intact records.
                log::error!(
                    "append to blob file {} failed, retiring it: {}",
                    file.handle.file_number(),
                    e
                );
                return Err(e);
            }
        };
        file.handle.add_data_bytes(index.size);
        file.handle.credit(index.size);

        if file.builder.file_size() >= self.target_file_size {
            if let Err(e) = self.seal(file) {
                self.abandon(&index);
                return Err(e);
            }
        } else {
            *active = Some(file);
        }
        Ok(StoredValue::Blob(index))
    }

    /// Seal the active file, if any, and return its number.
    pub fn seal_active(&self) -> Result<Option<FileNumber>> {
        let Some(file) = self.active.lock().take() else {
            return Ok(None);
        };
        let number = file.handle.file_number();
        self.seal(file)?;
        Ok(Some(number))
    }

    /// Give back the credit for a record the caller will never index.
    fn abandon(&self, index: &BlobIndex) {
        if let Err(e) = self.files.debit(index) {
            log::warn!(
                "releasing record {}:{} after a failed seal: {}",
                index.file_number,
                index.offset,
                e
            );
        }
    }

    fn open_file(&self) -> Result<ActiveFile> {
        let handle = self
            .files
            .register_new(FOREGROUND_LEVEL, self.codec.compression())?;
        let builder = BlobFileBuilder::create(
            handle.path().to_path_buf(),
            handle.file_number(),
            self.codec.clone(),
            true,
            self.sync,
        )?;
        log::debug!("opened foreground blob file {}", handle.file_number());
        Ok(ActiveFile { builder, handle })
    }

    fn seal(&self, file: ActiveFile) -> Result<()> {
        let sealed = file.builder.finish()?;
        self.files.seal(&file.handle, &sealed)
    }
}

impl std::fmt::Debug for ValueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueRouter")
            .field("min_blob_size", &self.min_blob_size)
            .field("target_file_size", &self.target_file_size)
            .field("active", &self.active.lock().as_ref().map(|a| a.handle.file_number()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::metrics::EngineMetrics;

    fn setup(min_blob_size: u64, target: u64) -> (tempfile::TempDir, Arc<BlobFileSet>, ValueRouter) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder(dir.path())
            .with_min_blob_size(min_blob_size)
            .with_blob_file_target_size(target)
            .with_sync_writes(false)
            .build()
            .unwrap();
        let files = Arc::new(
            BlobFileSet::open(config.blob_dir(), false, Arc::new(EngineMetrics::new())).unwrap(),
        );
        let router = ValueRouter::new(&config, Arc::clone(&files));
        (dir, files, router)
    }

    #[test]
    fn test_threshold_boundary() {
        let (_dir, files, router) = setup(100, 1 << 20);

        let small = router.route(b"a", vec![0u8; 99], RunMode::Normal).unwrap();
        assert_eq!(small, StoredValue::Inline(vec![0u8; 99]));

        let exact = router.route(b"b", vec![1u8; 100], RunMode::Normal).unwrap();
        let index = *exact.blob_index().unwrap();
        let handle = files.get(index.file_number).unwrap();
        assert_eq!(handle.get(b"b", &index).unwrap(), vec![1u8; 100]);
        assert_eq!(handle.live_bytes(), index.size);
    }

    #[test]
    fn test_non_normal_modes_write_inline() {
        let (_dir, files, router) = setup(10, 1 << 20);
        for mode in [RunMode::ReadOnly, RunMode::Fallback] {
            let stored = router.route(b"k", vec![7u8; 500], mode).unwrap();
            assert!(matches!(stored, StoredValue::Inline(_)));
        }
        assert!(files.is_empty());
    }

    #[test]
    fn test_abandoned_record_is_not_live() {
        let (_dir, files, router) = setup(10, 1 << 20);
        let kept = *router
            .route(b"a", vec![1u8; 300], RunMode::Normal)
            .unwrap()
            .blob_index()
            .unwrap();
        let lost = *router
            .route(b"b", vec![2u8; 300], RunMode::Normal)
            .unwrap()
            .blob_index()
            .unwrap();
        router.abandon(&lost);

        let handle = files.get(kept.file_number).unwrap();
        assert_eq!(handle.live_bytes(), kept.size);
        assert_eq!(handle.data_bytes(), kept.size + lost.size);

        // Sealing with the remaining live record keeps the file.
        router.seal_active().unwrap();
        assert!(!handle.is_obsolete());
        router.abandon(&kept);
        assert!(handle.is_obsolete());
    }

    #[test]
    fn test_rotates_at_target_size() {
        let (_dir, files, router) = setup(10, 1024);
        for i in 0..8u8 {
            router.route(&[i], vec![i; 400], RunMode::Normal).unwrap();
        }
        router.seal_active().unwrap();
        let stats = files.stats();
        assert!(stats.len() >= 2);
        assert!(stats.iter().all(|s| s.sealed));
    }
}
