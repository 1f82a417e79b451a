//! In-memory, process-local storage. The default backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use super::{Storage, StorageEvent, StorageKey, StorageOp};
use crate::error::Result;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    lists: HashMap<StorageKey, Vec<serde_json::Value>>,
    records: HashMap<StorageKey, serde_json::Value>,
}

/// Storage held in process memory. Nothing survives a restart.
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StorageEvent>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, key: &StorageKey, op: StorageOp, value: Option<serde_json::Value>) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(StorageEvent {
            key: key.clone(),
            op,
            value,
        });
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

// Events are published while the lock is held so subscribers see writes in
// storage order.
impl Storage for InMemoryStorage {
    fn add_to_list(&self, key: &StorageKey, item: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        inner.lists.entry(key.clone()).or_default().push(item.clone());
        self.publish(key, StorageOp::ListAppended, Some(item));
        Ok(())
    }

    fn get_list(&self, key: &StorageKey) -> Result<Vec<serde_json::Value>> {
        Ok(self.lock().lists.get(key).cloned().unwrap_or_default())
    }

    fn modify_list(
        &self,
        key: &StorageKey,
        modify: &mut dyn FnMut(&mut Vec<serde_json::Value>) -> bool,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let changed = match inner.lists.get_mut(key) {
            Some(list) => modify(list),
            None => {
                let mut empty = Vec::new();
                let changed = modify(&mut empty);
                if changed {
                    inner.lists.insert(key.clone(), empty);
                }
                changed
            }
        };
        if changed {
            self.publish(key, StorageOp::ListModified, None);
        }
        Ok(changed)
    }

    fn delete(&self, key: &StorageKey) -> Result<()> {
        let mut inner = self.lock();
        let list = inner.lists.remove(key).is_some();
        let record = inner.records.remove(key).is_some();
        if list || record {
            self.publish(key, StorageOp::Deleted, None);
        }
        Ok(())
    }

    fn get(&self, key: &StorageKey) -> Result<Option<serde_json::Value>> {
        Ok(self.lock().records.get(key).cloned())
    }

    fn set(&self, key: &StorageKey, value: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        inner.records.insert(key.clone(), value.clone());
        self.publish(key, StorageOp::Set, Some(value));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
