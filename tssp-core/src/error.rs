//! Error types for the TSSP storage engine

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for storage engine operations
pub type Result<T> = std::result::Result<T, TsspError>;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum TsspError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO operation on a known path failed
    #[error("{op} {path:?} failed: {source}")]
    IoWithPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A block read returned fewer bytes than requested
    #[error("Short read at offset {offset}: want {want} bytes, got {got}")]
    ShortRead { offset: u64, want: usize, got: usize },

    /// File name does not follow the TSSP naming grammar
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// The file was closed
    #[error("file closed")]
    FileClosed,

    /// The table store was closed
    #[error("table store closed")]
    StoreClosed,

    /// Compaction was stopped while running
    #[error("compaction stopped")]
    CompactionStopped,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TsspError {
    pub(crate) fn io_with_path(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        TsspError::IoWithPath {
            op,
            path: path.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsspError::Io(_) | TsspError::IoWithPath { .. })
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TsspError::Corruption(_)
                | TsspError::ChecksumMismatch { .. }
                | TsspError::ShortRead { .. }
                | TsspError::InvalidFileName(_)
        )
    }

    /// Check if error was caused by a closed file or store
    pub fn is_closed(&self) -> bool {
        matches!(self, TsspError::FileClosed | TsspError::StoreClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TsspError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(err.is_corruption());
        assert!(!err.is_retryable());

        let err = TsspError::io_with_path(
            "open",
            "/data/x.tssp",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("x.tssp"));

        assert!(TsspError::FileClosed.is_closed());
        assert!(TsspError::StoreClosed.is_closed());
        assert!(!TsspError::CompactionStopped.is_closed());
    }
}
