//! Server heartbeats.
//!
//! Each server periodically writes a [`HeartbeatRecord`] to
//! `server:<id>`. A listener on the storage event stream feeds every such
//! write into [`TaskStore::propagate_server`], which keeps the membership
//! view and evicts stale servers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{HeartbeatRecord, ServerModel};
use crate::storage::{SERVER_CATEGORY, Storage, StorageEvent, StorageExt, StorageKey, StorageOp};
use crate::store::TaskStore;

/// Write one heartbeat for `server_id` and return it.
pub fn write_heartbeat(storage: &dyn Storage, server_id: &str) -> Result<HeartbeatRecord> {
    let record = HeartbeatRecord {
        server_id: server_id.to_string(),
        timestamp: Utc::now(),
    };
    storage.set_as(&StorageKey::server(server_id), &record)?;
    Ok(record)
}

/// Feed a storage event into the membership view if it is a heartbeat.
///
/// Returns whether the event was applied.
pub fn apply(store: &TaskStore, event: &StorageEvent) -> bool {
    if event.key.category != SERVER_CATEGORY || event.op != StorageOp::Set {
        return false;
    }
    let Some(value) = &event.value else {
        return false;
    };
    match serde_json::from_value::<HeartbeatRecord>(value.clone()) {
        Ok(record) => {
            store.propagate_server(ServerModel::from(record));
            true
        }
        Err(e) => {
            warn!(key = %event.key, error = %e, "ignoring malformed heartbeat");
            false
        }
    }
}

/// Apply heartbeat writes from `rx` until shutdown.
pub async fn listen(
    store: Arc<TaskStore>,
    mut rx: broadcast::Receiver<StorageEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                Ok(event) => {
                    apply(&store, &event);
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The next heartbeat of each server catches us up.
                    warn!(skipped, "membership listener lagged");
                    continue;
                }
            }
        }
    }
    debug!("membership listener stopped");
}

/// Write a heartbeat for `server_id` now and then every `period`.
pub async fn beat(
    storage: Arc<dyn Storage>,
    server_id: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(server = %server_id, period_ms = period.as_millis() as u64, "heartbeat started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write_heartbeat(storage.as_ref(), &server_id) {
                    warn!(server = %server_id, error = %e, "failed to write heartbeat");
                }
            }
        }
    }
    debug!(server = %server_id, "heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::storage::InMemoryStorage;

    fn store(interval: Duration) -> TaskStore {
        TaskStore::in_memory(
            Options::default()
                .with_server_name("membership-test")
                .with_heartbeat_interval(interval),
        )
    }

    #[test]
    fn heartbeat_writes_reach_the_view() {
        let storage = InMemoryStorage::new();
        let mut rx = storage.subscribe();
        let store = store(Duration::from_secs(60));

        write_heartbeat(&storage, "node-a").unwrap();
        let event = rx.try_recv().unwrap();
        assert!(apply(&store, &event));

        let servers = store.servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "node-a");
    }

    #[test]
    fn other_writes_are_ignored() {
        let storage = InMemoryStorage::new();
        let mut rx = storage.subscribe();
        let store = store(Duration::from_secs(60));

        storage
            .set(&StorageKey::new("something", "else"), serde_json::json!(1))
            .unwrap();
        storage.delete(&StorageKey::server("node-a")).unwrap();
        while let Ok(event) = rx.try_recv() {
            assert!(!apply(&store, &event));
        }
        assert!(store.servers().is_empty());
    }

    #[test]
    fn stale_servers_are_evicted_on_the_next_heartbeat() {
        let store = store(Duration::from_secs(60));
        store.propagate_server(ServerModel {
            id: "old".into(),
            heartbeat: Utc::now() - chrono::TimeDelta::seconds(120),
        });
        store.propagate_server(ServerModel {
            id: "fresh".into(),
            heartbeat: Utc::now(),
        });

        let ids: Vec<String> = store.servers().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn beat_and_listen_keep_the_view_current() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = Arc::new(TaskStore::new(
            Options::default().with_server_name("membership-test"),
            Arc::clone(&storage),
        ));
        let (tx, rx) = watch::channel(false);

        let listener = tokio::spawn(listen(Arc::clone(&store), storage.subscribe(), rx.clone()));
        let heart = tokio::spawn(beat(
            Arc::clone(&storage),
            "node-a".into(),
            Duration::from_millis(10),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.servers().len(), 1);

        tx.send(true).unwrap();
        listener.await.unwrap();
        heart.await.unwrap();
    }
}
