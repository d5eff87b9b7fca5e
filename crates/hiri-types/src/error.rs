//! Error types for data parsing in hiri-types.

use thiserror::Error;

/// Errors that can occur when parsing timestamps, days or partition keys.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The value is not an ISO-8601 date-time or epoch seconds.
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// The value is not a `YYYY-MM-DD` calendar day.
    #[error("Invalid day: {0:?} (expected YYYY-MM-DD)")]
    InvalidDay(String),

    /// A partition key component failed validation.
    #[error("Invalid {field}: {reason}")]
    InvalidPartitionKey { field: &'static str, reason: String },
}

/// Result type alias using hiri-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
