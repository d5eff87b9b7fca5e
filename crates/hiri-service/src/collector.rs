//! Background collectors, one tokio task per partition.
//!
//! A collector moves through `Stopped → Starting → Polling ⇄ Backoff →
//! Stopped`. Starting rescans the partition's day files and resumes from the
//! newest stored timestamp (or midnight UTC today when the cache is empty).
//! Each poll fetches from the upstream under a hard timeout, stores the rows,
//! and publishes only the rows that were new. Empty or failed polls stretch
//! the sleep through [`Backoff`]; a poll that stored rows resets it.
//!
//! Stop requests are observed between polls and during the sleep, never in
//! the middle of a fetch or an append. [`CollectorRegistry::stop`] waits for
//! the task to exit, so once it returns nothing more is written for the
//! partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hiri_core::{Backoff, Cursor, SharedUpstream, UpstreamError};
use hiri_store::{DayIndex, DayStore};
use hiri_types::{Day, PartitionKey, Reading, Timestamp};

use crate::config::{CollectorConfig, UpstreamConfig};
use crate::hub::Hub;

/// Lifecycle phase of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Polling,
    Backoff,
}

/// Snapshot of one collector's state.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub key: PartitionKey,
    pub phase: Phase,
    /// Whether the task is alive.
    pub running: bool,
    /// Current sleep between polls, in seconds.
    pub interval_secs: f64,
    /// Newest timestamp known to be stored.
    pub high_water: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// Rows stored by the most recent successful poll.
    pub last_inserted: usize,
    pub consecutive_empty: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub rows_stored: u64,
    pub malformed_rows: u64,
}

impl CollectorStatus {
    fn new(key: PartitionKey) -> Self {
        Self {
            key,
            phase: Phase::Stopped,
            running: false,
            interval_secs: 0.0,
            high_water: None,
            started_at: None,
            last_poll_at: None,
            last_error_at: None,
            last_error: None,
            last_inserted: 0,
            consecutive_empty: 0,
            success_count: 0,
            failure_count: 0,
            rows_stored: 0,
            malformed_rows: 0,
        }
    }
}

/// Timing knobs shared by every collector.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Hard limit on one upstream fetch.
    pub poll_timeout: Duration,
    /// How long `stop` waits before warning that the task is slow to exit.
    pub stop_timeout: Duration,
}

impl CollectorSettings {
    pub fn from_config(collector: &CollectorConfig, upstream: &UpstreamConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(collector.base_interval_secs),
            max_interval: Duration::from_secs(collector.max_interval_secs),
            multiplier: collector.multiplier,
            poll_timeout: upstream.poll_timeout(),
            stop_timeout: collector.stop_timeout(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_interval, self.multiplier, self.max_interval)
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default(), &UpstreamConfig::default())
    }
}

/// Collector errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("upstream fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("store: {0}")]
    Store(#[from] hiri_store::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CollectorError {
    /// Errors after which the collector must not keep writing.
    fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(hiri_store::Error::WriteConflict(_)))
    }
}

#[derive(Clone)]
struct Context {
    store: Arc<DayStore>,
    hub: Arc<Hub>,
    upstream: SharedUpstream,
    settings: CollectorSettings,
}

struct Slot {
    status: Arc<RwLock<CollectorStatus>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Slot {
    fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}

/// Owns every collector task.
pub struct CollectorRegistry {
    ctx: Context,
    slots: Mutex<HashMap<PartitionKey, Slot>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("settings", &self.ctx.settings)
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new(
        store: Arc<DayStore>,
        hub: Arc<Hub>,
        upstream: SharedUpstream,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            ctx: Context {
                store,
                hub,
                upstream,
                settings,
            },
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Start collecting `key`. Returns `false` if it was already running.
    pub async fn start(&self, key: &PartitionKey) -> bool {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            status: Arc::new(RwLock::new(CollectorStatus::new(key.clone()))),
            task: None,
        });
        if slot.is_running() {
            debug!("Collector for {} already running", key);
            return false;
        }

        let token = CancellationToken::new();
        {
            let mut status = slot.status.write().await;
            status.phase = Phase::Starting;
            status.running = true;
            status.started_at = Some(OffsetDateTime::now_utc());
        }
        let handle = tokio::spawn(run(
            self.ctx.clone(),
            key.clone(),
            token.clone(),
            Arc::clone(&slot.status),
        ));
        slot.task = Some((token, handle));
        info!("Started collector for {}", key);
        true
    }

    /// Stop collecting `key` and wait for the task to exit.
    ///
    /// An in-flight poll is waited for; its fetch is bounded by the poll
    /// timeout and its append always completes. Returns `false` if it was not
    /// running.
    pub async fn stop(&self, key: &PartitionKey) -> bool {
        let (task, status) = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(key) else {
                return false;
            };
            let was_running = slot.is_running();
            (slot.task.take().filter(|_| was_running), Arc::clone(&slot.status))
        };
        let Some((token, mut handle)) = task else {
            return false;
        };

        token.cancel();
        let joined = match tokio::time::timeout(self.ctx.settings.stop_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "Collector for {} still finishing its poll after {:?}",
                    key, self.ctx.settings.stop_timeout
                );
                handle.await
            }
        };
        match joined {
            Ok(()) => info!("Stopped collector for {}", key),
            Err(e) => error!("Collector for {} ended abnormally: {}", key, e),
        }

        let mut status = status.write().await;
        status.phase = Phase::Stopped;
        status.running = false;
        true
    }

    /// Stop every running collector.
    pub async fn stop_all(&self) {
        let keys: Vec<PartitionKey> = self.slots.lock().await.keys().cloned().collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    pub async fn is_running(&self, key: &PartitionKey) -> bool {
        self.slots
            .lock()
            .await
            .get(key)
            .is_some_and(Slot::is_running)
    }

    /// Status of every collector ever started, sorted by key.
    pub async fn statuses(&self) -> Vec<CollectorStatus> {
        let slots = self.slots.lock().await;
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            let mut status = slot.status.read().await.clone();
            if !slot.is_running() {
                status.running = false;
                status.phase = Phase::Stopped;
            }
            out.push(status);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn status(&self, key: &PartitionKey) -> Option<CollectorStatus> {
        let slots = self.slots.lock().await;
        let slot = slots.get(key)?;
        let mut status = slot.status.read().await.clone();
        if !slot.is_running() {
            status.running = false;
            status.phase = Phase::Stopped;
        }
        Some(status)
    }

    pub async fn running_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| s.is_running())
            .count()
    }
}

/// Result of one successful poll.
struct PollOutcome {
    inserted: Vec<Reading>,
    next_cursor: Cursor,
    malformed: usize,
}

async fn run(
    ctx: Context,
    key: PartitionKey,
    token: CancellationToken,
    status: Arc<RwLock<CollectorStatus>>,
) {
    let mut backoff = ctx.settings.backoff();

    let Some(mut cursor) = resume(&ctx, &key, &token, &status, &mut backoff).await else {
        finish(&key, &status).await;
        return;
    };
    backoff.reset();

    loop {
        if token.is_cancelled() {
            break;
        }
        status.write().await.phase = Phase::Polling;

        match poll_once(&ctx, &key, cursor).await {
            Ok(outcome) => {
                let stored = outcome.inserted.len();
                cursor = outcome.next_cursor;
                let phase = if stored == 0 {
                    let next = backoff.grow();
                    debug!("No new rows for {}; next poll in {:?}", key, next);
                    Phase::Backoff
                } else {
                    backoff.reset();
                    Phase::Polling
                };

                {
                    let mut s = status.write().await;
                    s.phase = phase;
                    s.interval_secs = backoff.current().as_secs_f64();
                    s.last_poll_at = Some(OffsetDateTime::now_utc());
                    s.success_count += 1;
                    s.last_inserted = stored;
                    s.rows_stored += stored as u64;
                    s.malformed_rows += outcome.malformed as u64;
                    s.high_water = s.high_water.max(cursor.since);
                    if stored == 0 {
                        s.consecutive_empty += 1;
                    } else {
                        s.consecutive_empty = 0;
                    }
                }

                if stored > 0 {
                    let delivered = ctx.hub.publish(&key, outcome.inserted);
                    debug!(
                        "Stored {} rows for {} ({} live subscribers)",
                        stored, key, delivered
                    );
                }
            }
            Err(e) if e.is_fatal() => {
                error!("Collector for {} stopped: {}", key, e);
                record_failure(&status, &e).await;
                break;
            }
            Err(e) => {
                let next = backoff.grow();
                warn!("Poll failed for {}: {} (retry in {:?})", key, e, next);
                record_failure(&status, &e).await;
                let mut s = status.write().await;
                s.phase = Phase::Backoff;
                s.interval_secs = next.as_secs_f64();
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(backoff.current()) => {}
        }
    }

    finish(&key, &status).await;
}

/// Rebuild the index and derive the resume cursor, retrying with backoff.
///
/// Returns `None` if cancelled first.
async fn resume(
    ctx: &Context,
    key: &PartitionKey,
    token: &CancellationToken,
    status: &RwLock<CollectorStatus>,
    backoff: &mut Backoff,
) -> Option<Cursor> {
    loop {
        if token.is_cancelled() {
            return None;
        }
        status.write().await.phase = Phase::Starting;

        match load_index(ctx, key).await {
            Ok(index) => {
                let since = index
                    .high_water()
                    .unwrap_or_else(|| Timestamp::start_of_day(Day::today_utc()));
                info!(
                    "Collector for {} resuming after {} ({} stored rows over {} days)",
                    key,
                    since,
                    index.total(),
                    index.days().len()
                );
                status.write().await.high_water = index.high_water();
                return Some(Cursor::since(since));
            }
            Err(e) => {
                record_failure(status, &e).await;
                let next = backoff.grow();
                warn!("Could not load cache for {}: {} (retry in {:?})", key, e, next);
                {
                    let mut s = status.write().await;
                    s.phase = Phase::Backoff;
                    s.interval_secs = next.as_secs_f64();
                }
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(next) => {}
                }
            }
        }
    }
}

async fn load_index(ctx: &Context, key: &PartitionKey) -> Result<Arc<DayIndex>, CollectorError> {
    let store = Arc::clone(&ctx.store);
    let key = key.clone();
    let index = tokio::task::spawn_blocking(move || {
        let report = store.rebuild_index(&key)?;
        if report.truncated_files > 0 || report.skipped_lines > 0 {
            warn!(
                "Repaired cache for {}: {} truncated files, {} skipped lines",
                key, report.truncated_files, report.skipped_lines
            );
        }
        store.day_index(&key)
    })
    .await??;
    Ok(index)
}

async fn poll_once(
    ctx: &Context,
    key: &PartitionKey,
    cursor: Cursor,
) -> Result<PollOutcome, CollectorError> {
    let timeout = ctx.settings.poll_timeout;
    let batch = tokio::time::timeout(timeout, ctx.upstream.fetch(key, cursor))
        .await
        .map_err(|_| CollectorError::Timeout(timeout))??;

    if batch.malformed > 0 {
        debug!("Skipped {} malformed rows for {}", batch.malformed, key);
    }

    let store = Arc::clone(&ctx.store);
    let k = key.clone();
    let rows = batch.rows;
    let inserted = tokio::task::spawn_blocking(move || store.ingest(&k, &rows)).await??;

    Ok(PollOutcome {
        inserted,
        next_cursor: batch.next_cursor,
        malformed: batch.malformed,
    })
}

async fn record_failure(status: &RwLock<CollectorStatus>, error: &CollectorError) {
    let mut s = status.write().await;
    s.failure_count += 1;
    s.last_error = Some(error.to_string());
    s.last_error_at = Some(OffsetDateTime::now_utc());
}

async fn finish(key: &PartitionKey, status: &RwLock<CollectorStatus>) {
    let mut s = status.write().await;
    s.phase = Phase::Stopped;
    s.running = false;
    debug!("Collector loop for {} exited", key);
}
