//! Live fan-out of newly stored rows.
//!
//! Each partition gets its own `broadcast` channel, created on first
//! subscribe and dropped once its last receiver is gone. Publishing never
//! waits: without subscribers the event is discarded, and a subscriber that
//! falls more than the channel capacity behind receives [`HubError::Lagged`]
//! and is expected to disconnect and fall back to polling
//! [`Hub::rows_since`], which reads the same store the events came from.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use hiri_store::DayStore;
use hiri_types::{Day, PartitionKey, Reading, Timestamp};

/// One batch of rows newly stored for a partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub key: PartitionKey,
    /// Rows in time order.
    pub rows: Vec<Reading>,
    pub count: usize,
    /// Distinct days the rows belong to, ascending.
    pub days: Vec<Day>,
}

impl LiveEvent {
    pub fn new(key: PartitionKey, mut rows: Vec<Reading>) -> Self {
        rows.sort_by_key(|r| r.time);
        let days: BTreeSet<Day> = rows.iter().map(Reading::day).collect();
        Self {
            key,
            count: rows.len(),
            days: days.into_iter().collect(),
            rows,
        }
    }
}

/// Why a subscription stopped yielding events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("subscriber fell behind by {0} events")]
    Lagged(u64),
    #[error("channel closed")]
    Closed,
}

/// A live subscription to one partition.
pub struct Subscription {
    pub id: Uuid,
    pub key: PartitionKey,
    rx: broadcast::Receiver<Arc<LiveEvent>>,
}

impl Subscription {
    /// Wait for the next batch.
    pub async fn recv(&mut self) -> Result<Arc<LiveEvent>, HubError> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(n)) => {
                warn!("Subscriber {} on {} lagged by {} events", self.id, self.key, n);
                Err(HubError::Lagged(n))
            }
            Err(RecvError::Closed) => Err(HubError::Closed),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Per-partition broadcast hub.
#[derive(Debug)]
pub struct Hub {
    store: Arc<DayStore>,
    capacity: usize,
    channels: Mutex<HashMap<PartitionKey, broadcast::Sender<Arc<LiveEvent>>>>,
}

impl Hub {
    pub fn new(store: Arc<DayStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to new rows of `key`.
    pub fn subscribe(&self, key: &PartitionKey) -> Subscription {
        let mut channels = self.lock();
        let rx = match channels.get(key) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(self.capacity);
                channels.insert(key.clone(), tx);
                rx
            }
        };
        let id = Uuid::new_v4();
        debug!("Subscriber {} joined {}", id, key);
        Subscription {
            id,
            key: key.clone(),
            rx,
        }
    }

    /// Publish newly stored rows; returns how many subscribers got them.
    ///
    /// Empty batches are never published.
    pub fn publish(&self, key: &PartitionKey, rows: Vec<Reading>) -> usize {
        if rows.is_empty() {
            return 0;
        }
        let mut channels = self.lock();
        let Some(tx) = channels.get(key) else {
            return 0;
        };
        match tx.send(Arc::new(LiveEvent::new(key.clone(), rows))) {
            Ok(n) => n,
            Err(_) => {
                channels.remove(key);
                0
            }
        }
    }

    /// Live subscribers of `key`.
    pub fn subscriber_count(&self, key: &PartitionKey) -> usize {
        self.lock().get(key).map_or(0, |tx| tx.receiver_count())
    }

    /// Rows of `day` stored after `since`; the polling counterpart of
    /// [`Hub::subscribe`].
    pub fn rows_since(
        &self,
        key: &PartitionKey,
        day: Day,
        since: Option<Timestamp>,
    ) -> hiri_store::Result<Vec<Reading>> {
        self.store.read_day(key, day, since)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PartitionKey, broadcast::Sender<Arc<LiveEvent>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(device: &str) -> PartitionKey {
        PartitionKey::new("18", device, "datos").unwrap()
    }

    fn reading(time: &str) -> Reading {
        Reading::new("HIRIPRO-01", time.parse().unwrap(), None)
    }

    fn hub(capacity: usize) -> (TempDir, Hub) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DayStore::open(dir.path()).unwrap());
        (dir, Hub::new(store, capacity))
    }

    #[test]
    fn test_live_event_sorts_and_lists_days() {
        let event = LiveEvent::new(
            key("HIRIPRO-01"),
            vec![
                reading("2025-09-02T00:10:00"),
                reading("2025-09-01T23:50:00"),
                reading("2025-09-02T00:00:00"),
            ],
        );
        assert_eq!(event.count, 3);
        assert_eq!(event.rows[0].time.to_string(), "2025-09-01T23:50:00");
        assert_eq!(event.days.len(), 2);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"]["device_code"], "HIRIPRO-01");
        assert_eq!(json["days"][1], "2025-09-02");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let (_dir, hub) = hub(4);
        assert_eq!(hub.publish(&key("A"), vec![reading("2025-09-01T10:00:00")]), 0);
        assert_eq!(hub.subscriber_count(&key("A")), 0);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let (_dir, hub) = hub(4);
        let mut a = hub.subscribe(&key("A"));
        let mut b = hub.subscribe(&key("B"));

        assert_eq!(hub.publish(&key("A"), vec![reading("2025-09-01T10:00:00")]), 1);
        assert_eq!(hub.publish(&key("B"), vec![]), 0);

        let event = a.recv().await.unwrap();
        assert_eq!(event.key, key("A"));
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batches_arrive_in_publish_order() {
        let (_dir, hub) = hub(8);
        let mut sub = hub.subscribe(&key("A"));
        hub.publish(&key("A"), vec![reading("2025-09-01T10:00:00")]);
        hub.publish(&key("A"), vec![reading("2025-09-01T10:01:00")]);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(first.rows[0].time < second.rows[0].time);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_told_it_lagged() {
        let (_dir, hub) = hub(2);
        let mut sub = hub.subscribe(&key("A"));
        for minute in 0..5 {
            let time = format!("2025-09-01T10:{minute:02}:00");
            hub.publish(&key("A"), vec![reading(&time)]);
        }
        assert!(matches!(sub.recv().await, Err(HubError::Lagged(3))));
    }

    #[tokio::test]
    async fn test_channel_dropped_after_last_subscriber() {
        let (_dir, hub) = hub(2);
        let sub = hub.subscribe(&key("A"));
        assert_eq!(hub.subscriber_count(&key("A")), 1);
        drop(sub);

        assert_eq!(hub.publish(&key("A"), vec![reading("2025-09-01T10:00:00")]), 0);
        assert!(hub.lock().get(&key("A")).is_none());
    }

    #[tokio::test]
    async fn test_rows_since_reads_the_store() {
        let (_dir, hub) = hub(2);
        let k = key("HIRIPRO-01");
        hub.store
            .ingest(
                &k,
                &[reading("2025-09-01T10:00:00"), reading("2025-09-01T11:00:00")],
            )
            .unwrap();

        let day: Day = "2025-09-01".parse().unwrap();
        let since = Some("2025-09-01T10:00:00".parse().unwrap());
        let rows = hub.rows_since(&k, day, since).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time.to_string(), "2025-09-01T11:00:00");
    }
}
