//! Pluggable storage layer.
//!
//! Single source of truth for task lists, recurring references and
//! heartbeat records. Values are stored as JSON so a durable backend can
//! persist them without knowing the engine's types.
//!
//! Every write publishes a [`StorageEvent`] to subscribers before the write
//! call returns. Membership tracking listens to this stream for heartbeat
//! records instead of registering callbacks.

pub mod memory;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::Result;

pub use memory::InMemoryStorage;

/// Category of the live task queue. Scoped by server name.
pub const TASK_CATEGORY: &str = "task";
/// Category of named recurring references. Scoped by recurring name.
pub const RECURRING_CATEGORY: &str = "tasks:recurring";
/// Category of heartbeat records. Scoped by server id.
pub const SERVER_CATEGORY: &str = "server";

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Composite `(category, scope)` key. Distinct scopes never share data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    pub category: String,
    pub scope: String,
}

impl StorageKey {
    pub fn new(category: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            scope: scope.into(),
        }
    }

    /// The live task list of a server.
    pub fn tasks(server_name: &str) -> Self {
        Self::new(TASK_CATEGORY, server_name)
    }

    /// The reference record of a named recurring task.
    pub fn recurring(name: &str) -> Self {
        Self::new(RECURRING_CATEGORY, name)
    }

    /// The heartbeat record of a server.
    pub fn server(server_id: &str) -> Self {
        Self::new(SERVER_CATEGORY, server_id)
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.category, self.scope)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which write happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    ListAppended,
    ListModified,
    Set,
    Deleted,
}

/// Published on every write.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub key: StorageKey,
    pub op: StorageOp,
    /// The written value for `Set` and `ListAppended`.
    pub value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Key/list persistence with a write-event stream.
///
/// Implementations must be safe to share between threads. Each method is
/// atomic with respect to the key it touches.
pub trait Storage: Send + Sync {
    /// Append `item` to the list at `key`, creating the list if needed.
    fn add_to_list(&self, key: &StorageKey, item: serde_json::Value) -> Result<()>;

    /// The list at `key` in insertion order. Missing lists are empty.
    fn get_list(&self, key: &StorageKey) -> Result<Vec<serde_json::Value>>;

    /// Atomically edit the list at `key`. `modify` returns whether it changed
    /// anything; no event is published when it did not.
    fn modify_list(
        &self,
        key: &StorageKey,
        modify: &mut dyn FnMut(&mut Vec<serde_json::Value>) -> bool,
    ) -> Result<bool>;

    /// Remove whatever is stored at `key`.
    fn delete(&self, key: &StorageKey) -> Result<()>;

    /// The single record at `key`.
    fn get(&self, key: &StorageKey) -> Result<Option<serde_json::Value>>;

    /// Store a single record at `key`, replacing any previous one.
    fn set(&self, key: &StorageKey, value: serde_json::Value) -> Result<()>;

    /// Receive every subsequent write.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Typed helpers over any [`Storage`].
pub trait StorageExt: Storage {
    fn get_as<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<Option<T>> {
        self.get(key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    fn set_as<T: Serialize>(&self, key: &StorageKey, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }

    fn get_list_as<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<Vec<T>> {
        self.get_list(key)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    fn add_to_list_as<T: Serialize>(&self, key: &StorageKey, item: &T) -> Result<()> {
        self.add_to_list(key, serde_json::to_value(item)?)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
