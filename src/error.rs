//! LETHE - Custom Error Types
//! Defines the error hierarchy for the blob-separated storage engine.

use thiserror::Error;

use crate::types::FileNumber;

/// Custom Result type for the Lethe engine.
pub type Result<T> = std::result::Result<T, LetheError>;

/// Error types for the Lethe storage engine.
#[derive(Error, Debug)]
pub enum LetheError {
    /// I/O errors from file operations (WAL, blob files, manifest).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, record past file bounds).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// A blob index points at a file the engine no longer has.
    #[error("Blob file {0} referenced by index is missing")]
    BlobFileMissing(FileNumber),

    /// Recovery of WAL, manifest or blob files failed.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An option combination violates a documented precondition.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// No space left for a new blob file.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine is closing and refuses new background work.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl From<bincode::Error> for LetheError {
    fn from(err: bincode::Error) -> Self {
        LetheError::Serialization(err.to_string())
    }
}

impl LetheError {
    /// Map an I/O error raised while appending blob data, surfacing a full
    /// disk as resource exhaustion instead of a generic failure.
    pub fn from_append(err: std::io::Error) -> Self {
        // ENOSPC
        if err.raw_os_error() == Some(28) {
            return LetheError::ResourceExhausted(err.to_string());
        }
        LetheError::Io(err)
    }

    /// Returns true for errors caused by damaged or dangling on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LetheError::Corruption(_) | LetheError::BlobFileMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_maps_to_resource_exhausted() {
        let err = std::io::Error::from_raw_os_error(28);
        assert!(matches!(
            LetheError::from_append(err),
            LetheError::ResourceExhausted(_)
        ));
    }

    #[test]
    fn test_missing_file_is_corruption_not_not_found() {
        let err = LetheError::BlobFileMissing(7);
        assert!(err.is_corruption());
        assert!(!LetheError::ShuttingDown.is_corruption());
        assert!(err.to_string().contains('7'));
    }
}
