//! Background collector, day cache and live HTTP API for HIRI air-quality
//! sensors.
//!
//! This crate provides a service that:
//! - Polls the upstream telemetry API once per partition, resuming from the
//!   newest cached timestamp
//! - Stores new readings in the day-partitioned cache of `hiri-store`
//! - Serves cached days, pages and CSV exports over HTTP
//! - Pushes newly stored rows to WebSocket subscribers
//!
//! # REST API Endpoints
//!
//! - `GET /healthz`, `GET /api/health` - Liveness check
//! - `GET /api/status` - Uptime and per-partition collector state
//! - `POST /api/collector/start`, `POST /api/collector/stop` - Collector control
//! - `GET /api/day-index` - Cached days and the newest timestamp
//! - `GET /api/data` - Day reads (`mode=day&day=&since=`) or paged reads
//! - `GET /download/{raw|plotted}.csv` - CSV export
//! - `POST /api/upload` - CSV import into a partition
//! - `POST /admin/reindex`, `POST /admin/purge`, `GET /admin/logs` - Maintenance
//! - `WS /api/ws` - Live rows per subscribed partition
//!
//! Every endpoint takes `project_id`, `device_code` and `tabla`; missing
//! values fall back to `[defaults]`.
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/hiri/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/hiri/cache"
//!
//! [upstream]
//! base_url = "https://api-sensores.cmasccp.cl/listarDatosEstructuradosV2"
//! page_limit = 500
//!
//! [collector]
//! base_interval_secs = 30
//! max_interval_secs = 300
//!
//! [defaults]
//! project_id = "18"
//! device_code = "HIRIPRO-01"
//! tabla = "datos"
//!
//! [[partitions]]
//! device_code = "HIRIPRO-02"
//! ```

pub mod admin;
pub mod api;
pub mod collector;
pub mod config;
pub mod hub;
pub mod logbuf;
pub mod query;
pub mod state;
pub mod ws;

pub use collector::{CollectorRegistry, CollectorSettings, CollectorStatus, Phase};
pub use config::{
    CollectorConfig, Config, ConfigError, DefaultsConfig, LoggingConfig, PartitionConfig,
    ServerConfig, StorageConfig, UpstreamConfig,
};
pub use hub::{Hub, LiveEvent};
pub use logbuf::LogBuffer;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Every route of the service with tracing and CORS applied.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(admin::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
