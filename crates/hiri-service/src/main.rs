//! HIRI Service - Background collectors, day cache and live HTTP API.
//!
//! Run with: `cargo run -p hiri-service`

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use hiri_core::HttpUpstream;
use hiri_service::{AppState, Config, LogBuffer, app};
use hiri_store::DayStore;
use hiri_types::PartitionKey;

/// HIRI Service - Background collectors and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "hiri-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Cache directory (overrides config).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Upstream endpoint (overrides config).
    #[arg(long)]
    upstream_url: Option<String>,

    /// Disable background collectors (API only mode).
    #[arg(long)]
    no_collector: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(dir) = args.cache_dir {
        config.storage.path = dir;
    }
    if let Some(url) = args.upstream_url {
        config.upstream.base_url = url;
    }
    config.validate()?;

    // Initialize logging, mirrored into the buffer behind /admin/logs
    let logs = LogBuffer::new(config.logging.buffer_lines);
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("hiri_service=info".parse()?)
                .add_directive("hiri_core=info".parse()?)
                .add_directive("hiri_store=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .with(fmt::layer())
        .with(fmt::layer().with_writer(logs.clone()).with_ansi(false))
        .init();

    // Open the cache
    info!("Opening day cache at {:?}", config.storage.path);
    let store = DayStore::open(&config.storage.path)?;

    let upstream = HttpUpstream::new(config.upstream.http_config())?;
    info!("Upstream endpoint: {}", config.upstream.base_url);

    let autostart = config.collector.autostart && !args.no_collector;
    let addr: SocketAddr = config.server.bind.parse()?;

    // Create application state
    let state = AppState::new(store, Arc::new(upstream), config, logs);

    if autostart {
        let keys = startup_partitions(&state).await;
        for key in &keys {
            state.collectors.start(key).await;
        }
        info!("Started {} collector(s)", keys.len());
    } else {
        info!("Background collectors disabled");
    }

    let router = app(Arc::clone(&state));

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping collectors");
    state.collectors.stop_all().await;
    Ok(())
}

/// Configured partitions plus, when enabled, every device already cached
/// under the default project and tabla. Falls back to the default partition.
async fn startup_partitions(state: &AppState) -> BTreeSet<PartitionKey> {
    let config = state.config.read().await;
    let mut keys: BTreeSet<PartitionKey> = config.partition_keys().into_iter().collect();

    if config.collector.discover_cached {
        let defaults = &state.defaults;
        match state.store.list_devices(&defaults.project_id, &defaults.tabla) {
            Ok(devices) => {
                keys.extend(devices.into_iter().filter_map(|device| {
                    PartitionKey::new(&defaults.project_id, device, &defaults.tabla).ok()
                }));
            }
            Err(e) => warn!("Could not list cached devices: {}", e),
        }
    }

    if keys.is_empty() {
        match state.defaults.key() {
            Ok(key) => {
                keys.insert(key);
            }
            Err(e) => warn!("Default partition is invalid: {}", e),
        }
    }
    keys
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
