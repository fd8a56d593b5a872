//! LETHE - Blob-Separated Key-Value Storage Engine
//!
//! An LSM-tree storage engine that keeps large values out of the tree.
//! Values at or above `min_blob_size` are appended to blob files and the tree
//! stores only a small index pointing at them. Background garbage collection
//! rewrites the live values of mostly-dead files and reclaims the rest.
//!
//! ## Features
//! - **Key-value separation**: size-based routing into append-only blob files
//! - **Blob file format**: CRC32-checked records, optional zstd compression
//!   with trained dictionaries
//! - **Background GC**: sampling-based file selection, batched rewrites,
//!   compare-and-set or merge-operand commits
//! - **Level merge / range merge**: per-level sorted runs of blob files with a
//!   bounded number of overlapping runs
//! - **Fallback mode**: drain blob files back inline during compaction
//! - **Safe reclamation**: epoch-based reaper that never deletes a file a
//!   reader still holds
//! - **Metrics**: lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use lethe::{Config, Lethe};
//!
//! let config = Config::builder("./lethe_data")
//!     .with_min_blob_size(4096)
//!     .build()
//!     .unwrap();
//! let engine = Lethe::open(config).unwrap();
//!
//! engine.put(b"key".to_vec(), vec![0u8; 8192]).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), Some(vec![0u8; 8192]));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::{CompressionOptions, Config, ConfigBuilder};
pub use engine::blob::{BlobFileStats, FileState, PurgeStats};
pub use engine::gc::{GcOutcome, GcState, GcStats};
pub use engine::lsm::compaction::KeyRange;
pub use engine::metrics::EngineMetrics;
pub use engine::Lethe;
pub use error::{LetheError, Result};
pub use types::{BlobIndex, CompressionType, FileNumber, Key, RunMode, StoredValue, Value};
