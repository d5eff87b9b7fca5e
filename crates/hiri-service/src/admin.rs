//! Maintenance endpoints.
//!
//! - `/admin/reindex` rebuilds a partition's day index from its files
//!   (`reset=1` purges first) and restarts its collector
//! - `/admin/purge` stops the collector and deletes the partition
//! - `/admin/logs?tail=N` returns the most recent log lines, optionally only
//!   those mentioning one partition
//!
//! Reindex and purge answer both GET and POST. They take the partition's
//! collector down first so the store is never rewritten under a running poll.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hiri_store::RebuildReport;
use hiri_types::PartitionKey;

use crate::api::{AppError, with_store};
use crate::query::{PartitionParams, parse_flag, parse_tail};
use crate::state::AppState;

/// Create the admin router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/reindex", get(reindex_handler).post(reindex_handler))
        .route("/admin/purge", get(purge_handler).post(purge_handler))
        .route("/admin/logs", get(logs_handler))
}

/// Rebuild the day index of `key` and restart its collector.
///
/// With `reset` the partition's files are deleted first, so the collector
/// starts over from the beginning of the current day.
pub async fn reindex(
    state: &AppState,
    key: &PartitionKey,
    reset: bool,
) -> Result<RebuildReport, AppError> {
    let was_running = state.collectors.stop(key).await;
    info!(
        "Reindexing {} (reset: {}, collector was running: {})",
        key, reset, was_running
    );

    let rebuild_key = key.clone();
    let result = with_store(state, move |store| {
        if reset {
            store.purge(&rebuild_key)?;
        }
        store.rebuild_index(&rebuild_key)
    })
    .await;

    // the collector comes back even when the rebuild failed
    state.collectors.start(key).await;

    match result {
        Ok(report) => {
            info!("Reindexed {}: {:?}", key, report);
            Ok(report)
        }
        Err(e) => {
            warn!("Reindex of {} failed: {:?}", key, e);
            Err(e)
        }
    }
}

/// Stop the collector of `key` and delete everything cached for it.
///
/// Returns whether a collector was running.
pub async fn purge(state: &AppState, key: &PartitionKey) -> Result<bool, AppError> {
    let was_running = state.collectors.stop(key).await;
    let purge_key = key.clone();
    with_store(state, move |store| store.purge(&purge_key)).await?;
    info!("Purged {} (collector was running: {})", key, was_running);
    Ok(was_running)
}

/// Query parameters of `/admin/reindex`.
#[derive(Debug, Default, Deserialize)]
pub struct ReindexParams {
    #[serde(flatten)]
    pub partition: PartitionParams,
    pub reset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReindexResponse {
    pub ok: bool,
    pub key: PartitionKey,
    pub reset: bool,
    pub report: RebuildReport,
}

async fn reindex_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReindexParams>,
) -> Result<Json<ReindexResponse>, AppError> {
    let key = params.partition.key(&state.defaults)?;
    let reset = parse_flag("reset", params.reset.as_deref())?;
    let report = reindex(&state, &key, reset).await?;
    Ok(Json(ReindexResponse {
        ok: true,
        key,
        reset,
        report,
    }))
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub ok: bool,
    pub key: PartitionKey,
    pub collector_stopped: bool,
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
) -> Result<Json<PurgeResponse>, AppError> {
    let key = params.key(&state.defaults)?;
    let collector_stopped = purge(&state, &key).await?;
    Ok(Json(PurgeResponse {
        ok: true,
        key,
        collector_stopped,
    }))
}

/// Query parameters of `/admin/logs`.
#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    #[serde(flatten)]
    pub partition: PartitionParams,
    pub tail: Option<String>,
    /// Only lines containing this text.
    pub filter: Option<String>,
}

impl LogParams {
    /// Explicit `filter`, else the partition named by `device_code`.
    fn needle(&self, state: &AppState) -> Result<Option<String>, AppError> {
        if let Some(filter) = self.filter.as_deref().filter(|f| !f.is_empty()) {
            return Ok(Some(filter.to_string()));
        }
        if self.partition.device_code.is_none() {
            return Ok(None);
        }
        Ok(Some(self.partition.key(&state.defaults)?.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub count: usize,
    pub lines: Vec<String>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> Result<Json<LogsResponse>, AppError> {
    let tail = parse_tail(params.tail.as_deref())?;
    let needle = params.needle(&state)?;
    let lines = state.logs.tail(tail, needle.as_deref());
    Ok(Json(LogsResponse {
        count: lines.len(),
        lines,
    }))
}
