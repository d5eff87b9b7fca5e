//! Application state shared across handlers.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use hiri_core::SharedUpstream;
use hiri_store::DayStore;

use crate::collector::{CollectorRegistry, CollectorSettings};
use crate::config::{Config, DefaultsConfig};
use crate::hub::Hub;
use crate::logbuf::LogBuffer;

/// Shared application state.
pub struct AppState {
    /// Day cache.
    pub store: Arc<DayStore>,
    /// Live fan-out of new rows.
    pub hub: Arc<Hub>,
    /// Per-partition collectors.
    pub collectors: CollectorRegistry,
    /// Configuration (can be updated at runtime).
    pub config: RwLock<Config>,
    /// Partition defaults captured at startup.
    pub defaults: DefaultsConfig,
    /// Recent log lines for `/admin/logs`.
    pub logs: LogBuffer,
    pub started_at: OffsetDateTime,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl AppState {
    /// Create new application state.
    pub fn new(
        store: DayStore,
        upstream: SharedUpstream,
        config: Config,
        logs: LogBuffer,
    ) -> Arc<Self> {
        let store = Arc::new(store);
        let hub = Arc::new(Hub::new(Arc::clone(&store), config.server.broadcast_buffer));
        let collectors = CollectorRegistry::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            upstream,
            CollectorSettings::from_config(&config.collector, &config.upstream),
        );

        Arc::new(Self {
            store,
            hub,
            collectors,
            defaults: config.defaults.clone(),
            config: RwLock::new(config),
            logs,
            started_at: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiri_core::MockUpstream;
    use hiri_types::{Reading, Timestamp};
    use tempfile::TempDir;

    fn create_test_state() -> (TempDir, Arc<AppState>) {
        let dir = TempDir::new().unwrap();
        let store = DayStore::open(dir.path()).unwrap();
        let state = AppState::new(
            store,
            Arc::new(MockUpstream::new()),
            Config::default(),
            LogBuffer::new(16),
        );
        (dir, state)
    }

    #[tokio::test]
    async fn test_app_state_new() {
        let (_dir, state) = create_test_state();
        let config = state.config.read().await;
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(state.defaults.project_id, "18");
        assert!(state.collectors.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_default_partition_key() {
        let (_dir, state) = create_test_state();
        let key = state.defaults.key().unwrap();
        assert_eq!(key.to_string(), "18/HIRIPRO-01/datos");
    }

    #[tokio::test]
    async fn test_defaults_are_fixed_at_construction() {
        let (_dir, state) = create_test_state();
        state.config.write().await.defaults.project_id = "99".to_string();
        let key = state.defaults.key().unwrap();
        assert_eq!(key.project_id, "18");
    }

    #[tokio::test]
    async fn test_store_and_hub_share_data() {
        let (_dir, state) = create_test_state();
        let key = state.defaults.key().unwrap();
        let time: Timestamp = "2025-09-01T10:00:00".parse().unwrap();
        state
            .store
            .ingest(&key, &[Reading::new("HIRIPRO-01", time, Some(1))])
            .unwrap();

        let rows = state.hub.rows_since(&key, time.day(), None).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
