//! Error types for hiri-store.

use std::path::PathBuf;

use hiri_types::Day;

/// Result type for hiri-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hiri-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to create the cache directory.
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The cache root exists but cannot be written to.
    #[error("Cache directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A reading was appended to a day it does not belong to.
    #[error("Reading at {time} belongs to {found}, not {expected}")]
    DayMismatch {
        expected: Day,
        found: Day,
        time: String,
    },

    /// Two writers touched the same partition at once.
    #[error("Concurrent write to partition {0}")]
    WriteConflict(String),

    /// An uploaded CSV file could not be used.
    #[error("Invalid CSV: {0}")]
    InvalidCsv(String),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
