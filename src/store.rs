//! The task store: persistence, dispatcher fan-out and the membership view.
//!
//! Tasks live as a list at `task:<server name>` in the configured
//! [`Storage`]. Every state change goes through [`TaskStore::update`], which
//! is an atomic read-modify-write on that list.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Error, Result, panic_message};
use crate::event::{EventBus, EventKind};
use crate::model::{ServerModel, Task, TaskId, TaskState};
use crate::storage::{InMemoryStorage, Storage, StorageExt, StorageKey};
use crate::telemetry::metrics;

/// A fan-out sink invoked for every task added to the store.
pub trait Dispatcher: Send + Sync {
    fn execute(&self, task: &Task);
}

impl<F> Dispatcher for F
where
    F: Fn(&Task) + Send + Sync,
{
    fn execute(&self, task: &Task) {
        self(task)
    }
}

type DispatcherGroup = (String, Vec<Arc<dyn Dispatcher>>);

/// Owns the task list of one server scope.
pub struct TaskStore {
    storage: Arc<dyn Storage>,
    options: Options,
    key: StorageKey,
    /// Registration id → dispatchers, in registration order.
    dispatchers: RwLock<Vec<DispatcherGroup>>,
    servers: RwLock<HashMap<String, ServerModel>>,
    events: EventBus,
}

impl TaskStore {
    pub fn new(options: Options, storage: Arc<dyn Storage>) -> Self {
        info!(server = %options.server_name, "starting task store");
        Self {
            key: StorageKey::tasks(&options.server_name),
            storage,
            options,
            dispatchers: RwLock::new(Vec::new()),
            servers: RwLock::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    /// A store backed by a fresh [`InMemoryStorage`].
    pub fn in_memory(options: Options) -> Self {
        Self::new(options, Arc::new(InMemoryStorage::new()))
    }

    /// Publish to `events` instead of a private bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The backing storage, for components that keep their own records.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Persist `task`, then hand it to every registered dispatcher.
    ///
    /// Nothing is dispatched if the write fails. A panicking dispatcher is
    /// reported and does not stop the others.
    pub fn add(&self, task: &Task) -> Result<()> {
        debug!(id = %task.id, function = %task.body, "add task to storage");
        self.storage.add_to_list_as(&self.key, task)?;

        self.events.publish(EventKind::TaskAdded {
            id: task.id,
            function: task.body.function().to_string(),
            name: task.name.clone(),
        });

        for (registration, dispatcher) in self.dispatcher_snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| dispatcher.execute(task))) {
                let error = panic_message(&*panic);
                warn!(id = %task.id, %registration, %error, "dispatcher panicked");
                self.events.publish(EventKind::DispatcherFailed {
                    id: task.id,
                    registration,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Every task in storage order.
    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.storage.get_list_as(&self.key)
    }

    /// Look up one task. Only the matching entry is decoded.
    pub fn get(&self, id: TaskId) -> Result<Task> {
        let wanted = id.to_string();
        let entry = self
            .storage
            .get_list(&self.key)?
            .into_iter()
            .find(|v| has_id(v, &wanted))
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        Ok(serde_json::from_value(entry)?)
    }

    pub fn find(&self, predicate: impl Fn(&Task) -> bool) -> Result<Option<Task>> {
        Ok(self.tasks()?.into_iter().find(|t| predicate(t)))
    }

    pub fn filter(&self, predicate: impl Fn(&Task) -> bool) -> Result<Vec<Task>> {
        Ok(self.tasks()?.into_iter().filter(|t| predicate(t)).collect())
    }

    pub fn count(&self, predicate: impl Fn(&Task) -> bool) -> Result<usize> {
        Ok(self.tasks()?.iter().filter(|t| predicate(t)).count())
    }

    /// True when every task matches. Vacuously true for an empty store.
    pub fn all(&self, predicate: impl Fn(&Task) -> bool) -> Result<bool> {
        Ok(self.tasks()?.iter().all(predicate))
    }

    pub fn by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        self.filter(|t| t.state == state)
    }

    pub fn by_name(&self, name: &str) -> Result<Vec<Task>> {
        self.filter(|t| t.name.as_deref() == Some(name))
    }

    pub fn processed(&self) -> Result<Vec<Task>> {
        self.by_state(TaskState::Processed)
    }

    /// Atomically edit one task. Nothing is written if `edit` fails.
    pub fn update<F>(&self, id: TaskId, edit: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let wanted = id.to_string();
        let mut edit = Some(edit);
        let mut outcome: Option<Result<Task>> = None;

        self.storage.modify_list(&self.key, &mut |list| {
            let Some(slot) = list.iter_mut().find(|v| has_id(v, &wanted)) else {
                return false;
            };
            let result = (|| -> Result<Task> {
                let mut task: Task = serde_json::from_value(slot.clone())?;
                if let Some(edit) = edit.take() {
                    edit(&mut task)?;
                }
                *slot = serde_json::to_value(&task)?;
                Ok(task)
            })();
            let changed = result.is_ok();
            outcome = Some(result);
            changed
        })?;

        outcome.unwrap_or_else(|| Err(Error::NotFound(format!("task {id}"))))
    }

    /// Move a task to `to`. Returns the previous state and the updated task.
    pub fn transition(&self, id: TaskId, to: TaskState) -> Result<(TaskState, Task)> {
        let mut from = None;
        let task = self.update(id, |task| {
            from = Some(task.transition(to)?);
            Ok(())
        })?;
        let from = from.unwrap_or(to);

        debug!(%id, %from, %to, "state transition");
        metrics::task_state_transitions().add(
            1,
            &[
                opentelemetry::KeyValue::new("from", from.to_string()),
                opentelemetry::KeyValue::new("to", to.to_string()),
            ],
        );
        self.events
            .publish(EventKind::StateTransition { id, from, to });
        Ok((from, task))
    }

    /// Mark a task deleted. `Ok(false)` if no such task exists; deleting an
    /// already deleted task is a no-op.
    pub fn delete(&self, id: TaskId) -> Result<bool> {
        match self.get(id) {
            Ok(task) if task.state == TaskState::Deleted => return Ok(true),
            Ok(_) => {}
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        match self.transition(id, TaskState::Deleted) {
            Ok(_) => {
                self.events.publish(EventKind::TaskDeleted { id });
                Ok(true)
            }
            // Raced with another delete.
            Err(Error::InvalidTransition {
                from: TaskState::Deleted,
                ..
            }) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove every task of this store's scope.
    pub fn clear(&self) -> Result<()> {
        info!(key = %self.key, "clearing task store");
        self.storage.delete(&self.key)
    }

    // -----------------------------------------------------------------------
    // Dispatchers
    // -----------------------------------------------------------------------

    /// Register a group of dispatchers under `id`, replacing any previous
    /// group with that id.
    pub fn register_dispatchers(&self, id: impl Into<String>, dispatchers: Vec<Arc<dyn Dispatcher>>) {
        let id = id.into();
        info!(%id, count = dispatchers.len(), "register dispatchers");
        let mut groups = self
            .dispatchers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match groups.iter_mut().find(|(existing, _)| *existing == id) {
            Some(group) => group.1 = dispatchers,
            None => groups.push((id, dispatchers)),
        }
    }

    /// Remove the group registered under `id`.
    pub fn unregister_dispatchers(&self, id: &str) {
        info!(%id, "remove dispatchers");
        self.dispatchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| existing != id);
    }

    fn dispatcher_snapshot(&self) -> Vec<(String, Arc<dyn Dispatcher>)> {
        self.dispatchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(id, group)| group.iter().map(move |d| (id.clone(), Arc::clone(d))))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Upsert `server`, then evict every server whose last heartbeat is
    /// older than now minus the heartbeat interval. A heartbeat older than
    /// the one already tracked for that server is ignored.
    ///
    /// Eviction only happens here, driven by heartbeat traffic.
    pub fn propagate_server(&self, server: ServerModel) {
        let server_id = server.id.clone();
        let expiration = TimeDelta::from_std(self.options.heartbeat_interval)
            .ok()
            .and_then(|interval| Utc::now().checked_sub_signed(interval));

        let evicted: Vec<String> = {
            let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
            match servers.get_mut(&server.id) {
                Some(known) if known.heartbeat >= server.heartbeat => {
                    debug!(server = %server.id, "ignoring out-of-date heartbeat");
                }
                Some(known) => *known = server,
                None => {
                    servers.insert(server.id.clone(), server);
                }
            }

            let dead: Vec<String> = match expiration {
                Some(expiration) => servers
                    .values()
                    .filter(|s| s.heartbeat < expiration)
                    .map(|s| s.id.clone())
                    .collect(),
                None => Vec::new(),
            };
            for id in &dead {
                servers.remove(id);
            }
            dead
        };

        self.events
            .publish(EventKind::ServerPropagated { server_id });
        for server_id in evicted {
            info!(server = %server_id, "evicting server with stale heartbeat");
            metrics::servers_evicted().add(1, &[]);
            self.events.publish(EventKind::ServerEvicted { server_id });
        }
    }

    /// Point-in-time membership snapshot, ordered by server id.
    pub fn servers(&self) -> Vec<ServerModel> {
        let mut servers: Vec<ServerModel> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }
}

fn has_id(entry: &serde_json::Value, id: &str) -> bool {
    entry.get("id").and_then(serde_json::Value::as_str) == Some(id)
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
