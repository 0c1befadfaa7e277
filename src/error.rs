//! Error types for CellarDB
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CellarError
pub type Result<T> = std::result::Result<T, CellarError>;

/// Unified error type for CellarDB operations
#[derive(Debug, Error)]
pub enum CellarError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt segment {segment_id}: {reason}")]
    CorruptSegment { segment_id: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Compaction aborted")]
    CompactionAborted,

    // -------------------------------------------------------------------------
    // Catalog / Table Errors
    // -------------------------------------------------------------------------
    #[error("Table already exists: {0}")]
    AlreadyExists(String),

    #[error("Table not found: {0}")]
    NotFound(String),

    #[error("Table is disabled: {0}")]
    TableDisabled(String),

    #[error("Table is being deleted: {0}")]
    TableDeleting(String),

    #[error("Table is read-only after a log failure: {0}")]
    ReadOnly(String),

    #[error("Unknown column family '{family}' in table '{table}'")]
    UnknownFamily { table: String, family: String },

    #[error("Catalog corruption: {0}")]
    CatalogCorruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for CellarError {
    fn from(err: bincode::Error) -> Self {
        CellarError::Serialization(err.to_string())
    }
}

impl CellarError {
    /// True for checksum failures on segment data
    pub fn is_corruption(&self) -> bool {
        matches!(self, CellarError::CorruptSegment { .. })
    }

    pub(crate) fn corrupt_segment(segment_id: u64, reason: impl Into<String>) -> Self {
        CellarError::CorruptSegment {
            segment_id,
            reason: reason.into(),
        }
    }
}
