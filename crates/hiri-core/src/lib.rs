//! Upstream client for the HIRI sensor API.
//!
//! This crate talks to the remote telemetry API that HIRI PM2.5 stations
//! report to, and turns its loosely structured rows into [`Reading`]s.
//!
//! # Features
//!
//! - **Incremental fetch**: walk newest-first pages until the resume cursor
//! - **Schema detection**: map localized column headers onto reading fields
//! - **Retries**: bounded exponential retries with jitter for transient errors
//! - **Poll backoff**: multiplicative interval policy for idle or failing polls
//! - **Mock upstream**: in-memory table with failure injection for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use hiri_core::{Cursor, HttpUpstream, HttpUpstreamConfig, UpstreamSource};
//! use hiri_types::PartitionKey;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let upstream = HttpUpstream::new(HttpUpstreamConfig::default())?;
//!     let key = PartitionKey::new("18", "HIRIPRO-01", "datos")?;
//!
//!     let since = "2025-09-01T00:00:00".parse()?;
//!     let batch = upstream.fetch(&key, Cursor::since(since)).await?;
//!     for reading in &batch.rows {
//!         println!("{} pm2.5={:?}", reading.time, reading.pm25);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod error;
pub mod mock;
pub mod retry;
pub mod schema;
pub mod upstream;

pub use backoff::Backoff;
pub use error::{Result, UpstreamError};
pub use mock::MockUpstream;
pub use retry::{RetryConfig, with_retry};
pub use schema::{MalformedRow, UpstreamSchema};
pub use upstream::{
    Batch, Cursor, DEFAULT_BASE_URL, HttpUpstream, HttpUpstreamConfig, Page, UpstreamSource,
};

pub use hiri_types::{PartitionKey, Reading, Timestamp};

/// Shared handle to an upstream source.
pub type SharedUpstream = std::sync::Arc<dyn UpstreamSource>;
