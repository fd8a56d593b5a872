//! LETHE - Engine Configuration
//! Defines tunable parameters for the blob storage engine.
//!
//! A [`Config`] is built once through [`ConfigBuilder`], validated, and then
//! handed to [`crate::engine::Lethe::open`]. It has no setters: knobs that may
//! change at runtime (run mode, background GC) live on the engine instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{LetheError, Result};
use crate::types::{CompressionType, RunMode};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Compression tuning for blob files, independent of SST compression.
/// Mainly used to configure the compression dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    pub window_bits: i32,
    /// 32767 selects the algorithm's default level.
    pub level: i32,
    pub strategy: i32,
    /// Dictionary size cap; 0 disables dictionary compression.
    pub max_dict_bytes: u32,
    /// Bytes of sample data used to train the dictionary; 0 means
    /// `100 * max_dict_bytes`.
    pub zstd_max_train_bytes: u32,
}

impl CompressionOptions {
    pub const DEFAULT_LEVEL: i32 = 32767;

    pub fn effective_level(&self) -> i32 {
        if self.level == Self::DEFAULT_LEVEL {
            3
        } else {
            self.level
        }
    }

    pub fn train_bytes(&self) -> usize {
        if self.zstd_max_train_bytes > 0 {
            self.zstd_max_train_bytes as usize
        } else {
            self.max_dict_bytes as usize * 100
        }
    }
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            window_bits: -14,
            level: Self::DEFAULT_LEVEL,
            strategy: 0,
            max_dict_bytes: 0,
            zstd_max_train_bytes: 0,
        }
    }
}

/// Validated, immutable configuration for the Lethe storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    data_dir: PathBuf,
    blob_dir: PathBuf,
    min_blob_size: u64,
    gc_merge_rewrite: bool,
    blob_file_compression: CompressionType,
    compression_options: CompressionOptions,
    disable_background_gc: bool,
    level_merge: bool,
    range_merge: bool,
    max_sorted_runs: usize,
    max_gc_batch_size: u64,
    min_gc_batch_size: u64,
    blob_file_discardable_ratio: f64,
    sample_file_size_ratio: f64,
    merge_small_file_threshold: u64,
    max_background_gc: usize,
    purge_obsolete_files_period: Duration,
    blob_run_mode: RunMode,
    blob_file_target_size: u64,
    gc_interval: Duration,
    num_levels: usize,
    level_compaction_dynamic_level_base: bool,
    sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults always validate.
        ConfigBuilder::new("./data").into_config()
    }
}

impl Config {
    /// Start a builder rooted at `data_dir`.
    pub fn builder(data_dir: impl Into<PathBuf>) -> ConfigBuilder {
        ConfigBuilder::new(data_dir)
    }

    /// Create a default Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        ConfigBuilder::new(data_dir).into_config()
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let builder: ConfigBuilder =
            toml::from_str(text).map_err(|e| LetheError::Config(e.to_string()))?;
        builder.build()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Directory holding the LSM WAL and checkpoint.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding blob files and the blob manifest.
    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    pub fn min_blob_size(&self) -> u64 {
        self.min_blob_size
    }

    pub fn gc_merge_rewrite(&self) -> bool {
        self.gc_merge_rewrite
    }

    pub fn blob_file_compression(&self) -> CompressionType {
        self.blob_file_compression
    }

    pub fn compression_options(&self) -> &CompressionOptions {
        &self.compression_options
    }

    pub fn disable_background_gc(&self) -> bool {
        self.disable_background_gc
    }

    pub fn level_merge(&self) -> bool {
        self.level_merge
    }

    pub fn range_merge(&self) -> bool {
        self.range_merge
    }

    pub fn max_sorted_runs(&self) -> usize {
        self.max_sorted_runs
    }

    pub fn max_gc_batch_size(&self) -> u64 {
        self.max_gc_batch_size
    }

    pub fn min_gc_batch_size(&self) -> u64 {
        self.min_gc_batch_size
    }

    pub fn blob_file_discardable_ratio(&self) -> f64 {
        self.blob_file_discardable_ratio
    }

    pub fn sample_file_size_ratio(&self) -> f64 {
        self.sample_file_size_ratio
    }

    pub fn merge_small_file_threshold(&self) -> u64 {
        self.merge_small_file_threshold
    }

    pub fn max_background_gc(&self) -> usize {
        self.max_background_gc
    }

    /// Reaper period; `None` when obsolete files are never deleted.
    pub fn purge_obsolete_files_period(&self) -> Option<Duration> {
        if self.purge_obsolete_files_period.is_zero() {
            None
        } else {
            Some(self.purge_obsolete_files_period)
        }
    }

    pub fn blob_run_mode(&self) -> RunMode {
        self.blob_run_mode
    }

    pub fn blob_file_target_size(&self) -> u64 {
        self.blob_file_target_size
    }

    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Index of the bottom LSM level.
    pub fn last_level(&self) -> usize {
        self.num_levels - 1
    }

    pub fn level_compaction_dynamic_level_base(&self) -> bool {
        self.level_compaction_dynamic_level_base
    }

    pub fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// Ensure the data and blob directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.blob_dir)
    }
}

/// Mutable staging area for a [`Config`]. Also the TOML schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigBuilder {
    data_dir: PathBuf,
    blob_dir: Option<PathBuf>,
    min_blob_size: u64,
    gc_merge_rewrite: bool,
    blob_file_compression: CompressionType,
    compression_options: CompressionOptions,
    disable_background_gc: bool,
    level_merge: bool,
    range_merge: bool,
    max_sorted_runs: usize,
    max_gc_batch_size: u64,
    min_gc_batch_size: u64,
    blob_file_discardable_ratio: f64,
    sample_file_size_ratio: f64,
    merge_small_file_threshold: u64,
    max_background_gc: usize,
    purge_obsolete_files_period_sec: u64,
    blob_run_mode: RunMode,
    blob_file_target_size: u64,
    gc_interval_secs: u64,
    num_levels: usize,
    level_compaction_dynamic_level_base: bool,
    sync_writes: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new("./data")
    }
}

impl ConfigBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            blob_dir: None,
            min_blob_size: 4 * KB,
            gc_merge_rewrite: false,
            blob_file_compression: CompressionType::None,
            compression_options: CompressionOptions::default(),
            disable_background_gc: false,
            level_merge: false,
            range_merge: false,
            max_sorted_runs: 20,
            max_gc_batch_size: GB,
            min_gc_batch_size: 512 * MB,
            blob_file_discardable_ratio: 0.5,
            sample_file_size_ratio: 0.1,
            merge_small_file_threshold: 8 * MB,
            max_background_gc: 1,
            purge_obsolete_files_period_sec: 10,
            blob_run_mode: RunMode::Normal,
            blob_file_target_size: 256 * MB,
            gc_interval_secs: 10,
            num_levels: 7,
            level_compaction_dynamic_level_base: true,
            sync_writes: true,
        }
    }

    /// Directory for blob data. Default: `{data_dir}/titandb`.
    pub fn with_blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = Some(dir.into());
        self
    }

    /// Values of at least this many bytes go to blob files.
    pub fn with_min_blob_size(mut self, size: u64) -> Self {
        self.min_blob_size = size;
        self
    }

    /// Commit GC output as merge operands instead of compare-and-set writes.
    pub fn with_gc_merge_rewrite(mut self, enabled: bool) -> Self {
        self.gc_merge_rewrite = enabled;
        self
    }

    pub fn with_blob_file_compression(mut self, compression: CompressionType) -> Self {
        self.blob_file_compression = compression;
        self
    }

    pub fn with_compression_options(mut self, options: CompressionOptions) -> Self {
        self.compression_options = options;
        self
    }

    pub fn with_disable_background_gc(mut self, disabled: bool) -> Self {
        self.disable_background_gc = disabled;
        self
    }

    /// Requires `level_compaction_dynamic_level_base`.
    pub fn with_level_merge(mut self, enabled: bool) -> Self {
        self.level_merge = enabled;
        self
    }

    pub fn with_range_merge(mut self, enabled: bool) -> Self {
        self.range_merge = enabled;
        self
    }

    pub fn with_max_sorted_runs(mut self, runs: usize) -> Self {
        self.max_sorted_runs = runs;
        self
    }

    pub fn with_gc_batch_size(mut self, min: u64, max: u64) -> Self {
        self.min_gc_batch_size = min;
        self.max_gc_batch_size = max;
        self
    }

    pub fn with_blob_file_discardable_ratio(mut self, ratio: f64) -> Self {
        self.blob_file_discardable_ratio = ratio;
        self
    }

    pub fn with_sample_file_size_ratio(mut self, ratio: f64) -> Self {
        self.sample_file_size_ratio = ratio;
        self
    }

    pub fn with_merge_small_file_threshold(mut self, size: u64) -> Self {
        self.merge_small_file_threshold = size;
        self
    }

    pub fn with_max_background_gc(mut self, workers: usize) -> Self {
        self.max_background_gc = workers;
        self
    }

    /// 0 disables deletion of obsolete blob files.
    pub fn with_purge_obsolete_files_period_sec(mut self, secs: u64) -> Self {
        self.purge_obsolete_files_period_sec = secs;
        self
    }

    pub fn with_blob_run_mode(mut self, mode: RunMode) -> Self {
        self.blob_run_mode = mode;
        self
    }

    pub fn with_blob_file_target_size(mut self, size: u64) -> Self {
        self.blob_file_target_size = size;
        self
    }

    pub fn with_gc_interval_secs(mut self, secs: u64) -> Self {
        self.gc_interval_secs = secs;
        self
    }

    pub fn with_num_levels(mut self, levels: usize) -> Self {
        self.num_levels = levels;
        self
    }

    pub fn with_level_compaction_dynamic_level_base(mut self, enabled: bool) -> Self {
        self.level_compaction_dynamic_level_base = enabled;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Validate the options and freeze them into a [`Config`].
    pub fn build(self) -> Result<Config> {
        self.validate()?;
        Ok(self.into_config())
    }

    fn validate(&self) -> Result<()> {
        let ratio_ok = |r: f64| (0.0..=1.0).contains(&r);
        if self.min_gc_batch_size > self.max_gc_batch_size {
            return Err(LetheError::Config(format!(
                "min_gc_batch_size ({}) exceeds max_gc_batch_size ({})",
                self.min_gc_batch_size, self.max_gc_batch_size
            )));
        }
        if !ratio_ok(self.blob_file_discardable_ratio) {
            return Err(LetheError::Config(format!(
                "blob_file_discardable_ratio must be within [0, 1], got {}",
                self.blob_file_discardable_ratio
            )));
        }
        if !ratio_ok(self.sample_file_size_ratio) || self.sample_file_size_ratio == 0.0 {
            return Err(LetheError::Config(format!(
                "sample_file_size_ratio must be within (0, 1], got {}",
                self.sample_file_size_ratio
            )));
        }
        if self.max_background_gc == 0 {
            return Err(LetheError::Config("max_background_gc must be at least 1".into()));
        }
        if self.max_sorted_runs == 0 {
            return Err(LetheError::Config("max_sorted_runs must be at least 1".into()));
        }
        if self.num_levels < 2 || self.num_levels > u8::MAX as usize {
            return Err(LetheError::Config(format!(
                "num_levels must be within [2, 255], got {}",
                self.num_levels
            )));
        }
        if self.blob_file_target_size == 0 || self.gc_interval_secs == 0 {
            return Err(LetheError::Config(
                "blob_file_target_size and gc_interval_secs must be positive".into(),
            ));
        }
        if !self.blob_file_compression.is_supported() {
            return Err(LetheError::Config(format!(
                "blob file compression {:?} is not available in this build",
                self.blob_file_compression
            )));
        }
        if self.level_merge && !self.level_compaction_dynamic_level_base {
            return Err(LetheError::Precondition(
                "level_merge requires level_compaction_dynamic_level_base".into(),
            ));
        }
        Ok(())
    }

    fn into_config(self) -> Config {
        let blob_dir = self
            .blob_dir
            .unwrap_or_else(|| self.data_dir.join("titandb"));
        Config {
            data_dir: self.data_dir,
            blob_dir,
            min_blob_size: self.min_blob_size,
            gc_merge_rewrite: self.gc_merge_rewrite,
            blob_file_compression: self.blob_file_compression,
            compression_options: self.compression_options,
            disable_background_gc: self.disable_background_gc,
            level_merge: self.level_merge,
            range_merge: self.range_merge,
            max_sorted_runs: self.max_sorted_runs,
            max_gc_batch_size: self.max_gc_batch_size,
            min_gc_batch_size: self.min_gc_batch_size,
            blob_file_discardable_ratio: self.blob_file_discardable_ratio,
            sample_file_size_ratio: self.sample_file_size_ratio,
            merge_small_file_threshold: self.merge_small_file_threshold,
            max_background_gc: self.max_background_gc,
            purge_obsolete_files_period: Duration::from_secs(self.purge_obsolete_files_period_sec),
            blob_run_mode: self.blob_run_mode,
            blob_file_target_size: self.blob_file_target_size,
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            num_levels: self.num_levels,
            level_compaction_dynamic_level_base: self.level_compaction_dynamic_level_base,
            sync_writes: self.sync_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_option_surface() {
        let config = Config::new("/tmp/db");
        assert_eq!(config.blob_dir(), Path::new("/tmp/db/titandb"));
        assert_eq!(config.min_blob_size(), 4096);
        assert_eq!(config.max_sorted_runs(), 20);
        assert_eq!(config.max_gc_batch_size(), GB);
        assert_eq!(config.min_gc_batch_size(), 512 * MB);
        assert_eq!(config.blob_file_discardable_ratio(), 0.5);
        assert_eq!(config.sample_file_size_ratio(), 0.1);
        assert_eq!(config.merge_small_file_threshold(), 8 * MB);
        assert_eq!(config.max_background_gc(), 1);
        assert_eq!(config.purge_obsolete_files_period(), Some(Duration::from_secs(10)));
        assert_eq!(config.blob_run_mode(), RunMode::Normal);
        assert!(!config.gc_merge_rewrite());
        assert!(!config.disable_background_gc());
    }

    #[test]
    fn test_zero_purge_period_disables_reaper() {
        let config = Config::builder("/tmp/db")
            .with_purge_obsolete_files_period_sec(0)
            .build()
            .unwrap();
        assert_eq!(config.purge_obsolete_files_period(), None);
    }

    #[test]
    fn test_rejects_inverted_batch_bounds() {
        let err = Config::builder("/tmp/db")
            .with_gc_batch_size(10, 5)
            .build()
            .unwrap_err();
        assert!(matches!(err, LetheError::Config(_)));
    }

    #[test]
    fn test_level_merge_requires_dynamic_level_base() {
        let err = Config::builder("/tmp/db")
            .with_level_merge(true)
            .with_level_compaction_dynamic_level_base(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, LetheError::Precondition(_)));
    }

    #[test]
    fn test_rejects_unsupported_compression() {
        let err = Config::builder("/tmp/db")
            .with_blob_file_compression(CompressionType::Snappy)
            .build()
            .unwrap_err();
        assert!(matches!(err, LetheError::Config(_)));
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml_str(
            r#"
            data_dir = "/var/lib/lethe"
            min_blob_size = 100
            blob_run_mode = "readonly"
            range_merge = true
            max_sorted_runs = 5

            [compression_options]
            max_dict_bytes = 16384
            "#,
        )
        .unwrap();
        assert_eq!(config.min_blob_size(), 100);
        assert_eq!(config.blob_run_mode(), RunMode::ReadOnly);
        assert!(config.range_merge());
        assert_eq!(config.max_sorted_runs(), 5);
        assert_eq!(config.compression_options().max_dict_bytes, 16384);
        assert_eq!(config.compression_options().window_bits, -14);
        assert_eq!(config.blob_dir(), Path::new("/var/lib/lethe/titandb"));
    }

    #[test]
    fn test_from_toml_rejects_unknown_key() {
        assert!(Config::from_toml_str("min_blob_sise = 3").is_err());
    }
}
