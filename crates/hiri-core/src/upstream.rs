//! Client for the remote sensor API.
//!
//! The API exposes one paginated table per project. Rows are returned newest
//! first, so an incremental poll walks pages from offset 0 until it reaches a
//! row older than its cursor.
//!
//! # Example
//!
//! ```no_run
//! use hiri_core::{Cursor, HttpUpstream, HttpUpstreamConfig, UpstreamSource};
//! use hiri_types::PartitionKey;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = HttpUpstream::new(HttpUpstreamConfig::default())?;
//! let key = PartitionKey::new("18", "HIRIPRO-01", "datos")?;
//!
//! let batch = upstream.fetch(&key, Cursor::default()).await?;
//! println!("{} rows, resume from {:?}", batch.rows.len(), batch.next_cursor);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use hiri_types::{PartitionKey, Reading, Timestamp};

use crate::error::{Result, UpstreamError};
use crate::retry::{RetryConfig, with_retry};
use crate::schema::UpstreamSchema;

/// Default upstream endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api-sensores.cmasccp.cl/listarDatosEstructuradosV2";

/// Position in the upstream stream from which a poll resumes.
///
/// A walk that hit the page cap before reaching `since` is continued from
/// `offset` by the next fetch; `since` only advances once a walk completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Rows strictly older than this are not returned.
    pub since: Option<Timestamp>,
    /// Upstream offset at which an unfinished walk continues.
    pub offset: usize,
    /// Newest row seen by the unfinished walk.
    pub pending: Option<Timestamp>,
}

impl Cursor {
    pub fn since(since: Timestamp) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    /// Whether the previous fetch stopped before reaching `since`.
    pub fn is_mid_walk(&self) -> bool {
        self.offset > 0
    }
}

/// Result of one incremental fetch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Normalized rows in ascending time order.
    pub rows: Vec<Reading>,
    /// Cursor for the next fetch.
    pub next_cursor: Cursor,
    /// Rows skipped because they could not be normalized.
    pub malformed: usize,
    /// Number of upstream pages read.
    pub pages: u32,
}

/// One raw upstream page after normalization.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Normalized rows in upstream order.
    pub rows: Vec<Reading>,
    /// Rows skipped because they could not be normalized.
    pub malformed: usize,
    /// Number of rows the upstream returned, including malformed ones.
    pub raw_len: usize,
}

/// A source of upstream sensor rows.
///
/// Implementors provide single-page access; [`UpstreamSource::fetch`] builds
/// the incremental walk on top of it.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Read one page of at most `limit` rows starting at `offset`, newest first.
    async fn fetch_page(&self, key: &PartitionKey, limit: usize, offset: usize) -> Result<Page>;

    /// Page size used by [`UpstreamSource::fetch`].
    fn page_limit(&self) -> usize;

    /// Upper bound on pages read by one [`UpstreamSource::fetch`].
    fn max_pages(&self) -> u32;

    /// Fetch every row at or after the cursor.
    ///
    /// Stops when a page is short, when a page reaches past the cursor, or
    /// after [`UpstreamSource::max_pages`] pages. Rows equal to the cursor are
    /// kept; deduplication is the store's job. When the page cap ends the walk
    /// early, the returned cursor keeps `since` and records the offset to
    /// continue from, so no row between `since` and the last page is skipped.
    async fn fetch(&self, key: &PartitionKey, cursor: Cursor) -> Result<Batch> {
        let limit = self.page_limit().max(1);
        let max_pages = self.max_pages().max(1);

        let mut batch = Batch::default();
        let mut offset = cursor.offset;
        let mut complete = false;
        while batch.pages < max_pages {
            let page = self.fetch_page(key, limit, offset).await?;
            batch.pages += 1;
            batch.malformed += page.malformed;

            let mut reached_cursor = false;
            for row in page.rows {
                match cursor.since {
                    Some(since) if row.time < since => reached_cursor = true,
                    _ => batch.rows.push(row),
                }
            }

            offset += limit;
            if reached_cursor || page.raw_len < limit {
                complete = true;
                break;
            }
        }

        batch.rows.sort_by_key(|r| r.time);
        let newest = cursor.pending.max(batch.rows.last().map(|r| r.time));
        batch.next_cursor = if complete {
            Cursor {
                since: cursor.since.max(newest),
                ..Cursor::default()
            }
        } else {
            debug!(
                "Stopped after {} pages for {} (page limit reached), continuing at offset {}",
                batch.pages, key, offset
            );
            Cursor {
                since: cursor.since,
                offset,
                pending: newest,
            }
        };
        Ok(batch)
    }
}

/// Settings for [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    pub base_url: String,
    pub page_limit: usize,
    pub max_pages_per_poll: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_limit: 500,
            max_pages_per_poll: 500,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// HTTP implementation of [`UpstreamSource`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    config: HttpUpstreamConfig,
}

impl HttpUpstream {
    /// Create a client with its own connection pool.
    pub fn new(config: HttpUpstreamConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(UpstreamError::InvalidConfig(format!(
                "base_url must start with http:// or https://, got: {}",
                config.base_url
            )));
        }
        if config.page_limit == 0 {
            return Err(UpstreamError::InvalidConfig(
                "page_limit must be greater than 0".to_string(),
            ));
        }

        let client = Client::builder()
            .user_agent(concat!("hiri-service/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpUpstreamConfig {
        &self.config
    }

    async fn request_page(&self, key: &PartitionKey, limit: usize, offset: usize) -> Result<Page> {
        let url = &self.config.base_url;
        let response = self
            .client
            .get(url)
            .query(&[
                ("tabla", key.tabla.as_str()),
                ("disp.id_proyecto", key.project_id.as_str()),
                ("disp.codigo_interno", key.device_code.as_str()),
            ])
            .query(&[("limite", limit), ("offset", offset)])
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(url, e))?;
        parse_page(status, &body, &key.device_code)
    }

    fn classify(&self, url: &str, error: reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            UpstreamError::Timeout(self.config.request_timeout)
        } else if error.is_connect() {
            UpstreamError::Connect {
                url: url.to_string(),
                source: error,
            }
        } else {
            UpstreamError::Request(error)
        }
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_page(&self, key: &PartitionKey, limit: usize, offset: usize) -> Result<Page> {
        with_retry(&self.config.retry, "fetch_page", || {
            self.request_page(key, limit, offset)
        })
        .await
    }

    fn page_limit(&self) -> usize {
        self.config.page_limit
    }

    fn max_pages(&self) -> u32 {
        self.config.max_pages_per_poll
    }
}

/// Decode an upstream response body into a [`Page`].
///
/// A failure envelope saying there are no records is an empty page regardless
/// of the HTTP status.
pub fn parse_page(status: StatusCode, body: &str, fallback_device: &str) -> Result<Page> {
    let payload: Option<Value> = serde_json::from_str(body).ok();

    if payload.as_ref().is_some_and(is_no_records) {
        return Ok(Page::default());
    }

    if !status.is_success() {
        let message = payload
            .as_ref()
            .and_then(|v| v.get("error").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| truncate(body, 200));
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            message,
        });
    }

    let payload = payload.ok_or_else(|| UpstreamError::Decode(truncate(body, 200)))?;
    let rows = extract_rows(&payload)?;
    let schema = UpstreamSchema::from_rows(&rows);

    let mut page = Page {
        raw_len: rows.len(),
        ..Page::default()
    };
    for row in &rows {
        match schema.to_reading(row, fallback_device) {
            Ok(reading) => page.rows.push(reading),
            Err(e) => {
                page.malformed += 1;
                debug!("Skipping malformed upstream row: {}", e);
            }
        }
    }
    if page.malformed > 0 {
        warn!(
            "{} of {} upstream rows were malformed",
            page.malformed, page.raw_len
        );
    }
    Ok(page)
}

fn extract_rows(payload: &Value) -> Result<Vec<Map<String, Value>>> {
    let table = match payload.get("data") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(data) => data.get("tableData"),
    };
    match table {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect()),
        Some(other) => Err(UpstreamError::Decode(format!(
            "tableData is not an array: {}",
            truncate(&other.to_string(), 80)
        ))),
    }
}

fn is_no_records(payload: &Value) -> bool {
    let failed = payload
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("fail"));
    if !failed {
        return false;
    }
    payload
        .get("error")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .is_some_and(|m| m.to_lowercase().contains("no hay registros"))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}
