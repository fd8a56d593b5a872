//! LETHE - Core Type Definitions
//! Defines fundamental types used across the storage engine.

use serde::{Deserialize, Serialize};

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
pub type Value = Vec<u8>;

/// Monotonically increasing identity of a blob file.
pub type FileNumber = u64;

/// Pointer stored in the LSM-tree in place of a large value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobIndex {
    /// Blob file holding the record.
    pub file_number: FileNumber,
    /// Byte offset of the record inside the file.
    pub offset: u64,
    /// Length of the whole on-disk record (header, key and payload).
    pub size: u64,
}

/// What the LSM-tree holds for a live key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Small value kept in the LSM-tree itself.
    Inline(Value),
    /// Large value separated into a blob file.
    Blob(BlobIndex),
}

impl StoredValue {
    /// Returns the blob index if this value lives in a blob file.
    pub fn blob_index(&self) -> Option<&BlobIndex> {
        match self {
            StoredValue::Blob(index) => Some(index),
            StoredValue::Inline(_) => None,
        }
    }

    /// Approximate number of bytes this value occupies in the LSM-tree.
    pub fn encoded_len(&self) -> usize {
        match self {
            StoredValue::Inline(value) => value.len(),
            StoredValue::Blob(_) => 24,
        }
    }
}

/// Merge operand emitted by GC merge-rewrite.
///
/// The operand only takes effect when the key still points at `expected`;
/// any later write to the key makes it stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOperand {
    pub expected: BlobIndex,
    pub replacement: StoredValue,
    /// GC cycle that produced this operand.
    pub generation: u64,
}

impl MergeOperand {
    /// Fold this operand onto the current value of a key.
    pub fn apply(&self, current: Option<StoredValue>) -> Option<StoredValue> {
        match current {
            Some(StoredValue::Blob(index)) if index == self.expected => {
                Some(self.replacement.clone())
            }
            other => other,
        }
    }
}

/// Engine-wide policy for blob writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunMode {
    /// Route large values to blob files.
    #[default]
    Normal = 0,
    /// Stop writing new blob data; existing blob files stay readable and
    /// garbage collected.
    #[serde(alias = "read_only")]
    ReadOnly = 1,
    /// Convert blob values back into inline values on flush, compaction
    /// and GC.
    Fallback = 2,
}

impl RunMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RunMode::Normal),
            1 => Some(RunMode::ReadOnly),
            2 => Some(RunMode::Fallback),
            _ => None,
        }
    }

    /// Whether new values may be written into blob files.
    pub fn allows_blob_writes(self) -> bool {
        self == RunMode::Normal
    }
}

/// Compression algorithm tag stored in every blob file header.
/// The numeric values follow the RocksDB compression type numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Snappy = 1,
    Zlib = 2,
    Bz2 = 3,
    Lz4 = 4,
    Lz4hc = 5,
    Xpress = 6,
    Zstd = 7,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Zlib),
            3 => Some(CompressionType::Bz2),
            4 => Some(CompressionType::Lz4),
            5 => Some(CompressionType::Lz4hc),
            6 => Some(CompressionType::Xpress),
            7 => Some(CompressionType::Zstd),
            _ => None,
        }
    }

    /// Returns true if this build can read and write the algorithm.
    pub fn is_supported(self) -> bool {
        match self {
            CompressionType::None => true,
            CompressionType::Zstd => cfg!(feature = "compression"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(file_number: FileNumber, offset: u64) -> BlobIndex {
        BlobIndex {
            file_number,
            offset,
            size: 64,
        }
    }

    #[test]
    fn test_merge_operand_applies_to_expected_index() {
        let op = MergeOperand {
            expected: index(1, 8),
            replacement: StoredValue::Blob(index(9, 8)),
            generation: 1,
        };
        let current = Some(StoredValue::Blob(index(1, 8)));
        assert_eq!(op.apply(current), Some(StoredValue::Blob(index(9, 8))));
    }

    #[test]
    fn test_merge_operand_is_stale_after_overwrite() {
        let op = MergeOperand {
            expected: index(1, 8),
            replacement: StoredValue::Blob(index(9, 8)),
            generation: 1,
        };
        let newer = Some(StoredValue::Inline(b"fresh".to_vec()));
        assert_eq!(op.apply(newer.clone()), newer);
        assert_eq!(op.apply(None), None);
        let moved = Some(StoredValue::Blob(index(1, 200)));
        assert_eq!(op.apply(moved.clone()), moved);
    }

    #[test]
    fn test_run_mode_numbering() {
        assert_eq!(RunMode::from_u8(0), Some(RunMode::Normal));
        assert_eq!(RunMode::from_u8(2), Some(RunMode::Fallback));
        assert_eq!(RunMode::from_u8(3), None);
        assert!(RunMode::Normal.allows_blob_writes());
        assert!(!RunMode::ReadOnly.allows_blob_writes());
    }
}
