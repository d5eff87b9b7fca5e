//! Mock upstream for testing.
//!
//! [`MockUpstream`] holds an in-memory table per partition and serves it
//! newest first through the same paging contract as the real API, so the
//! incremental walk in [`UpstreamSource::fetch`] is exercised unchanged.
//!
//! # Features
//!
//! - **Failure injection**: fail every request, or only the next N requests
//! - **Latency simulation**: delay each page to test timeouts and cancellation
//! - **Request accounting**: count page requests to assert on pagination

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use hiri_types::{PartitionKey, Reading};

use crate::error::Result;
use crate::retry::unavailable;
use crate::upstream::{Page, UpstreamSource};

/// A scripted upstream for tests.
///
/// # Example
///
/// ```
/// use hiri_core::{Cursor, MockUpstream, UpstreamSource};
/// use hiri_types::{PartitionKey, Reading};
///
/// #[tokio::main]
/// async fn main() {
///     let key = PartitionKey::new("18", "HIRIPRO-01", "datos").unwrap();
///     let upstream = MockUpstream::new();
///     let time = "2025-09-01T10:00:00".parse().unwrap();
///     upstream.push(&key, vec![Reading::new("HIRIPRO-01", time, Some(1))]).await;
///
///     let batch = upstream.fetch(&key, Cursor::default()).await.unwrap();
///     assert_eq!(batch.rows.len(), 1);
/// }
/// ```
pub struct MockUpstream {
    tables: RwLock<HashMap<PartitionKey, Vec<Reading>>>,
    page_limit: usize,
    max_pages: u32,
    should_fail: AtomicBool,
    /// Number of upcoming requests that fail before succeeding again.
    remaining_failures: AtomicU32,
    /// Simulated page latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    page_requests: AtomicU32,
    malformed_per_page: AtomicU32,
}

impl std::fmt::Debug for MockUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockUpstream")
            .field("page_limit", &self.page_limit)
            .field("max_pages", &self.max_pages)
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .field("page_requests", &self.page_requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    /// Create an empty mock with a page size of 500.
    pub fn new() -> Self {
        Self::with_page_limit(500)
    }

    /// Create an empty mock with a custom page size.
    pub fn with_page_limit(page_limit: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            page_limit: page_limit.max(1),
            max_pages: 500,
            should_fail: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            page_requests: AtomicU32::new(0),
            malformed_per_page: AtomicU32::new(0),
        }
    }

    /// Limit the number of pages per fetch.
    #[must_use]
    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Add rows to a partition's remote table.
    pub async fn push(&self, key: &PartitionKey, rows: Vec<Reading>) {
        let mut tables = self.tables.write().await;
        let table = tables.entry(key.clone()).or_default();
        table.extend(rows);
        // newest first, like the real API
        table.sort_by(|a, b| b.time.cmp(&a.time));
    }

    /// Drop every row of a partition.
    pub async fn clear(&self, key: &PartitionKey) {
        self.tables.write().await.remove(key);
    }

    /// Make every request fail until reset.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` requests, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Delay every page by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Report `count` malformed rows on every page.
    pub fn set_malformed_per_page(&self, count: u32) {
        self.malformed_per_page.store(count, Ordering::Relaxed);
    }

    /// Number of page requests served or failed so far.
    pub fn page_requests(&self) -> u32 {
        self.page_requests.load(Ordering::Relaxed)
    }

    fn take_failure(&self) -> bool {
        if self.should_fail.load(Ordering::Relaxed) {
            return true;
        }
        self.remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl UpstreamSource for MockUpstream {
    async fn fetch_page(&self, key: &PartitionKey, limit: usize, offset: usize) -> Result<Page> {
        self.page_requests.fetch_add(1, Ordering::Relaxed);

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.take_failure() {
            return Err(unavailable("mock upstream failure"));
        }

        let tables = self.tables.read().await;
        let rows: Vec<Reading> = tables
            .get(key)
            .map(|table| table.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default();
        let malformed = self.malformed_per_page.load(Ordering::Relaxed) as usize;

        Ok(Page {
            raw_len: rows.len() + malformed,
            rows,
            malformed,
        })
    }

    fn page_limit(&self) -> usize {
        self.page_limit
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }
}
