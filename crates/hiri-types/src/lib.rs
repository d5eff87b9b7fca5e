//! Shared types for the HIRI telemetry service.
//!
//! This crate holds the data model used by the upstream client, the day cache
//! and the HTTP service:
//!
//! - [`Reading`]: one PM2.5 sensor sample
//! - [`Timestamp`] and [`Day`]: device wall-clock time and its calendar day
//! - [`PartitionKey`]: the `(project_id, device_code, tabla)` scope of every
//!   collector, cache directory and query
//!
//! # Example
//!
//! ```
//! use hiri_types::{PartitionKey, Reading, Timestamp};
//!
//! let key = PartitionKey::new("18", "HIRIPRO-01", "datos")?;
//! let time: Timestamp = "2025-09-01T10:00:00".parse()?;
//! let reading = Reading::new(&key.device_code, time, Some(1));
//! assert_eq!(reading.day().to_string(), "2025-09-01");
//! # Ok::<(), hiri_types::ParseError>(())
//! ```

pub mod error;
pub mod timestamp;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use timestamp::{Day, Timestamp};
pub use types::{DedupKey, PartitionKey, Reading, validate_component};
