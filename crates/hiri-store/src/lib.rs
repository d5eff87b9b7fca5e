//! Local day cache for HIRI sensor readings.
//!
//! Readings are kept in append-only JSONL files, one per partition key and
//! calendar day. An in-memory [`DayIndex`] per partition tracks per-day record
//! counts and the newest timestamp, and is rebuilt from the files on first
//! access, so the files on disk are the only durable state.
//!
//! # Features
//!
//! - Deduplicating appends keyed on `(envio_n, time)`
//! - Day reads with an optional `since` filter
//! - Snapshot-consistent paging across days in either direction
//! - Crash recovery: partial trailing records are truncated on rebuild
//! - CSV import and export
//!
//! # Example
//!
//! ```no_run
//! use hiri_store::{DayStore, Order};
//! use hiri_types::PartitionKey;
//!
//! let store = DayStore::open_default()?;
//! let key = PartitionKey::new("18", "HIRIPRO-01", "datos").unwrap();
//!
//! for day in store.list_days(&key)? {
//!     println!("{day}: {} rows", store.day_index(&key)?.count(day));
//! }
//! let newest = store.read_page(&key, 10, 0, Order::Descending)?;
//! # Ok::<(), hiri_store::Error>(())
//! ```

mod error;
mod export;
mod index;
mod store;

pub use error::{Error, Result};
pub use export::{CSV_COLUMNS, export_csv, parse_csv};
pub use index::{DayIndex, DaySummary, RebuildReport};
pub use store::{DayStore, ImportResult, Order};

/// Default cache directory following platform conventions.
///
/// - Linux: `~/.local/share/hiri/cache`
/// - macOS: `~/Library/Application Support/hiri/cache`
/// - Windows: `C:\Users\<user>\AppData\Local\hiri\cache`
pub fn default_cache_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("hiri")
        .join("cache")
}
