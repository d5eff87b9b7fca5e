//! REST API endpoints for the hiri-service.
//!
//! Every read goes through the day cache; nothing here talks to the upstream.
//! Query parameters are validated by [`crate::query`] before any store access,
//! and store calls run on the blocking pool via [`with_store`].
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]:
//! `{"error": "..."}` with 400 for invalid parameters or uploads, 404 for
//! unknown routes under `/download`, 501 for formats produced elsewhere and
//! 500 for storage failures.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

use hiri_store::{DayStore, ImportResult, Order, export_csv};
use hiri_types::{Day, Reading, Timestamp};

use crate::collector::CollectorStatus;
use crate::query::{self, DataParams, DataQuery, DayIndexView, PartitionParams, QueryError, RowKind};
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/healthz", get(health))
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Collector control
        .route("/api/collector/start", post(collector_start))
        .route("/api/collector/stop", post(collector_stop))
        // Data endpoints
        .route("/api/day-index", get(get_day_index))
        .route("/api/data", get(get_data))
        .route("/api/upload", post(upload_csv))
        .route("/download/{file}", get(download))
}

/// Run a store operation on the blocking pool.
pub(crate) async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&DayStore) -> hiri_store::Result<T> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AppError::Internal(format!("store task failed: {e}")))?
        .map_err(AppError::from)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: u64,
    /// Collectors currently running.
    pub running: usize,
    /// Every collector started since boot.
    pub collectors: Vec<CollectorStatus>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let now = OffsetDateTime::now_utc();
    let collectors = state.collectors.statuses().await;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        started_at: state.started_at,
        uptime_seconds: (now - state.started_at).whole_seconds().max(0) as u64,
        running: collectors.iter().filter(|c| c.running).count(),
        collectors,
    })
}

/// Response for collector control actions.
#[derive(Debug, Serialize)]
pub struct CollectorActionResponse {
    pub success: bool,
    pub message: String,
    pub running: bool,
}

/// Start the collector of one partition.
async fn collector_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
) -> Result<Json<CollectorActionResponse>, AppError> {
    let key = params.key(&state.defaults)?;
    let started = state.collectors.start(&key).await;
    Ok(Json(CollectorActionResponse {
        success: started,
        message: if started {
            format!("Collector started for {key}")
        } else {
            format!("Collector for {key} is already running")
        },
        running: true,
    }))
}

/// Stop the collector of one partition.
async fn collector_stop(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
) -> Result<Json<CollectorActionResponse>, AppError> {
    let key = params.key(&state.defaults)?;
    let stopped = state.collectors.stop(&key).await;
    Ok(Json(CollectorActionResponse {
        success: stopped,
        message: if stopped {
            format!("Collector stopped for {key}")
        } else {
            format!("Collector for {key} is not running")
        },
        running: false,
    }))
}

/// Days with cached data and the high-water mark.
///
/// Without `device_code` the days of every cached device are merged.
async fn get_day_index(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
) -> Result<Json<DayIndexView>, AppError> {
    let scope = params.scope(&state.defaults)?;
    let view = with_store(&state, move |store| query::day_index(store, &scope)).await?;
    Ok(Json(view))
}

/// Rows returned by `/api/data`.
#[derive(Debug, Serialize)]
pub struct DataResponse {
    #[serde(rename = "type")]
    pub kind: RowKind,
    pub count: usize,
    /// Day reads only: whether rows of several devices were merged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<Day>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    /// Page reads only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limite: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    pub rows: Vec<Reading>,
}

/// Day reads (`mode=day`) or paged reads over the cache.
async fn get_data(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DataParams>,
) -> Result<Json<DataResponse>, AppError> {
    let request = params.validate(&state.defaults)?;
    let shape = request.clone();
    let rows = with_store(&state, move |store| query::read(store, &request)).await?;

    let mut response = DataResponse {
        kind: RowKind::default(),
        count: rows.len(),
        aggregated: None,
        day: None,
        since: None,
        limite: None,
        offset: None,
        order: None,
        rows,
    };
    match shape {
        DataQuery::Day {
            scope,
            day,
            since,
            kind,
        } => {
            response.kind = kind;
            response.aggregated = Some(scope.is_aggregate());
            response.day = Some(day);
            response.since = since;
        }
        DataQuery::Page {
            limit,
            offset,
            order,
            kind,
            ..
        } => {
            response.kind = kind;
            response.limite = Some(limit);
            response.offset = Some(offset);
            response.order = Some(order);
        }
    }
    Ok(Json(response))
}

/// CSV export of cached rows: `/download/{raw|plotted}.{csv|xlsx}`.
async fn download(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    Query(params): Query<DataParams>,
) -> Result<Response, AppError> {
    let (kind, ext) = file
        .split_once('.')
        .ok_or_else(|| AppError::NotFound(format!("Unknown download: {file}")))?;
    let kind: RowKind = kind
        .parse()
        .map_err(|_| AppError::NotFound(format!("Unknown download: {file}")))?;
    match ext {
        "csv" => {}
        "xlsx" => {
            return Err(AppError::NotImplemented(
                "XLSX exports are produced by the report formatter".to_string(),
            ));
        }
        other => return Err(AppError::NotFound(format!("Unknown format: {other}"))),
    }

    let request = params.validate_download(&state.defaults, kind)?;
    let rows = with_store(&state, move |store| query::read(store, &request)).await?;

    let mut body = Vec::new();
    export_csv(&rows, &mut body)?;

    let filename = download_filename(kind, OffsetDateTime::now_utc());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// `<kind>_YYYYMMDD_HHMMSS.csv`, stamped with `now`.
fn download_filename(kind: RowKind, now: OffsetDateTime) -> String {
    let stamp = now
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| "export".to_string());
    format!("{}_{stamp}.csv", kind.as_str())
}

/// Import a CSV body into one partition and publish the new rows.
async fn upload_csv(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
    body: Bytes,
) -> Result<Json<ImportResult>, AppError> {
    let key = params.key(&state.defaults)?;
    if body.is_empty() {
        return Err(AppError::BadRequest("CSV body is empty".to_string()));
    }

    let import_key = key.clone();
    let mut result = with_store(&state, move |store| {
        store.import_csv(&import_key, body.as_ref())
    })
    .await?;

    let rows = std::mem::take(&mut result.rows);
    let delivered = state.hub.publish(&key, rows);
    info!(
        "Upload into {}: {} new rows, {} live subscribers notified",
        key, result.imported, delivered
    );
    Ok(Json(result))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    NotImplemented(String),
    Store(hiri_store::Error),
    Internal(String),
}

impl From<hiri_store::Error> for AppError {
    fn from(e: hiri_store::Error) -> Self {
        match e {
            hiri_store::Error::InvalidCsv(_) | hiri_store::Error::Csv(_) => {
                AppError::BadRequest(e.to_string())
            }
            e => AppError::Store(e),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use hiri_core::MockUpstream;
    use hiri_types::PartitionKey;

    use crate::config::Config;
    use crate::logbuf::LogBuffer;

    fn create_test_state() -> (TempDir, Arc<AppState>) {
        let dir = TempDir::new().unwrap();
        let store = DayStore::open(dir.path()).unwrap();
        let state = AppState::new(
            store,
            Arc::new(MockUpstream::new()),
            Config::default(),
            LogBuffer::new(64),
        );
        (dir, state)
    }

    async fn response_body(response: Response) -> String {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn get_json(state: &Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .with_state(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response_body(response).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    fn seed(state: &AppState, device: &str, rows: &[(&str, bool)]) {
        let key = PartitionKey::new("18", device, "datos").unwrap();
        let readings: Vec<Reading> = rows
            .iter()
            .enumerate()
            .map(|(i, (time, plottable))| {
                let mut r = Reading::new(device, time.parse().unwrap(), Some(i as u64));
                if *plottable {
                    r.lat = Some(-33.45);
                    r.lon = Some(-70.66);
                    r.pm25 = Some(12.0);
                }
                r
            })
            .collect();
        state.store.ingest(&key, &readings).unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (_dir, state) = create_test_state();
        for uri in ["/healthz", "/api/health"] {
            let (status, json) = get_json(&state, uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"], "ok");
            assert!(json["version"].is_string());
            assert!(json["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn test_day_index_empty_partition() {
        let (_dir, state) = create_test_state();
        let (status, json) = get_json(&state, "/api/day-index?device_code=HIRIPRO-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["days"], serde_json::json!([]));
        assert!(json["cursor"].is_null());
    }

    #[tokio::test]
    async fn test_day_index_aggregates_devices() {
        let (_dir, state) = create_test_state();
        seed(&state, "A", &[("2025-09-01T10:00:00", true)]);
        seed(&state, "B", &[("2025-09-03T08:00:00", true)]);

        let (_, json) = get_json(&state, "/api/day-index").await;
        assert_eq!(json["days"], serde_json::json!(["2025-09-01", "2025-09-03"]));
        assert_eq!(json["cursor"], "2025-09-03T08:00:00");

        let (_, json) = get_json(&state, "/api/day-index?device_code=A").await;
        assert_eq!(json["days"], serde_json::json!(["2025-09-01"]));
    }

    #[tokio::test]
    async fn test_data_day_mode_since_and_type() {
        let (_dir, state) = create_test_state();
        seed(
            &state,
            "HIRIPRO-01",
            &[
                ("2025-09-01T10:00:00", true),
                ("2025-09-01T10:01:00", false),
                ("2025-09-01T10:02:00", true),
            ],
        );

        let base = "/api/data?mode=day&day=2025-09-01&device_code=HIRIPRO-01";
        let (status, json) = get_json(&state, base).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["type"], "plotted");
        assert_eq!(json["count"], 2);
        assert_eq!(json["aggregated"], false);

        let (_, json) = get_json(&state, &format!("{base}&type=raw")).await;
        assert_eq!(json["count"], 3);

        let (_, json) =
            get_json(&state, &format!("{base}&type=raw&since=2025-09-01T10:00:00")).await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["rows"][0]["time"], "2025-09-01T10:01:00");
    }

    #[tokio::test]
    async fn test_data_page_mode() {
        let (_dir, state) = create_test_state();
        seed(
            &state,
            "HIRIPRO-01",
            &[
                ("2025-09-01T10:00:00", true),
                ("2025-09-02T10:00:00", true),
                ("2025-09-03T10:00:00", true),
            ],
        );

        let (status, json) = get_json(&state, "/api/data?limite=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 2);
        assert_eq!(json["order"], "desc");
        assert_eq!(json["rows"][0]["time"], "2025-09-03T10:00:00");

        let (_, json) = get_json(&state, "/api/data?limite=2&offset=2&paginate=0").await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["rows"][0]["time"], "2025-09-01T10:00:00");

        let (_, json) = get_json(&state, "/api/data?limite=5&order=asc").await;
        assert_eq!(json["rows"][0]["time"], "2025-09-01T10:00:00");
    }

    #[tokio::test]
    async fn test_invalid_parameters_return_400() {
        let (_dir, state) = create_test_state();
        for uri in [
            "/api/data?limite=0",
            "/api/data?limite=5001",
            "/api/data?offset=-3",
            "/api/data?type=heatmap",
            "/api/data?mode=day",
            "/api/data?mode=day&day=01-09-2025",
            "/api/data?mode=day&day=2025-09-01&since=soon",
            "/api/day-index?device_code=..",
            "/api/day-index?project_id=a%2Fb",
        ] {
            let (status, json) = get_json(&state, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(json["error"].is_string(), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_download_csv() {
        let (_dir, state) = create_test_state();
        seed(
            &state,
            "HIRIPRO-01",
            &[("2025-09-01T10:00:00", true), ("2025-09-01T11:00:00", false)],
        );

        let response = router()
            .with_state(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/download/raw.csv?day=2025-09-01&device_code=HIRIPRO-01")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"raw_"));

        let body = response_body(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("device_code,time,envio_n"));
    }

    #[test]
    fn test_download_filename_stamp() {
        let now = time::macros::datetime!(2025-03-04 05:06:07 UTC);
        assert_eq!(download_filename(RowKind::Raw, now), "raw_20250304_050607.csv");
    }

    #[tokio::test]
    async fn test_download_formats() {
        let (_dir, state) = create_test_state();

        let (status, json) = get_json(&state, "/download/plotted.xlsx").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(json["error"].is_string());

        let (status, _) = get_json(&state, "/download/heat.csv").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(&state, "/download/raw.pdf").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(&state, "/download/raw.csv?limite=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_imports_and_publishes() {
        let (_dir, state) = create_test_state();
        let key = PartitionKey::new("18", "HIRIPRO-05", "datos").unwrap();
        let mut sub = state.hub.subscribe(&key);

        let csv = "time,lat,lon,pm25\n\
                   2025-09-01T10:00:00,-33.4,-70.6,11\n\
                   2025-09-01T10:01:00,-33.4,-70.6,12\n\
                   bad,,,\n";
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/upload?device_code=HIRIPRO-05")
                .header(header::CONTENT_TYPE, "text/csv")
                .body(Body::from(csv))
                .unwrap()
        };

        let response = router()
            .with_state(Arc::clone(&state))
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["imported"], 2);
        assert_eq!(json["duplicates"], 0);
        assert_eq!(json["skipped"], 1);
        assert!(json.get("rows").is_none());

        let event = sub.recv().await.unwrap();
        assert_eq!(event.count, 2);

        let response = router()
            .with_state(Arc::clone(&state))
            .oneshot(request())
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["imported"], 0);
        assert_eq!(json["duplicates"], 2);
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_csv() {
        let (_dir, state) = create_test_state();
        for body in ["", "pm25,lat\n1,2\n"] {
            let response = router()
                .with_state(Arc::clone(&state))
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/upload")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_status_and_collector_control() {
        let (_dir, state) = create_test_state();

        let app = router().with_state(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collector/start?device_code=HIRIPRO-03")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["success"], true);

        let (_, json) = get_json(&state, "/api/status").await;
        assert_eq!(json["running"], 1);
        assert_eq!(json["collectors"][0]["key"]["device_code"], "HIRIPRO-03");

        let app = router().with_state(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/collector/stop?device_code=HIRIPRO-03")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["running"], false);

        let (_, json) = get_json(&state, "/api/status").await;
        assert_eq!(json["running"], 0);
        assert_eq!(json["collectors"][0]["phase"], "stopped");
    }

    #[test]
    fn test_app_error_status_codes() {
        let cases = [
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::NotImplemented("x".into()), StatusCode::NOT_IMPLEMENTED),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                AppError::from(hiri_store::Error::InvalidCsv("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(hiri_store::Error::WriteConflict("k".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
