//! LETHE - Blob storage
//! Append-only blob files, their catalog and the manifest that persists it.

pub mod builder;
pub mod compression;
pub mod epoch;
pub mod file_set;
pub mod format;
pub mod manifest;
pub mod meta;
pub mod reader;

pub use self::builder::{BlobFileBuilder, SealedFile};
pub use self::file_set::{BlobFileSet, BlobFileStats, PurgeStats};
pub use self::meta::{BlobFileHandle, BlobFileMeta, FileState};
pub use self::reader::{BlobFileReader, BlobRecord};
