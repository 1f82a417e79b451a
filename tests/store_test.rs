//! Integration tests for the task store: persistence, dispatch and membership.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broadcast_rs::config::Options;
use broadcast_rs::error::{Error, Result};
use broadcast_rs::event::EventKind;
use broadcast_rs::model::{Schedule, ServerModel, Task, TaskBody, TaskState};
use broadcast_rs::storage::{InMemoryStorage, Storage, StorageEvent, StorageKey};
use broadcast_rs::store::{Dispatcher, TaskStore};
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio::sync::broadcast;

fn options() -> Options {
    Options::default()
        .with_server_name("store-test")
        .with_heartbeat_interval(Duration::from_secs(60))
}

fn task(function: &str) -> Task {
    Task::new(TaskBody::new(function), json!(null), Schedule::Immediate)
}

/// Wraps in-memory storage and fails list appends on demand.
struct FlakyStorage {
    inner: InMemoryStorage,
    fail_appends: AtomicBool,
}

impl Storage for FlakyStorage {
    fn add_to_list(&self, key: &StorageKey, item: serde_json::Value) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk on fire".into()));
        }
        self.inner.add_to_list(key, item)
    }

    fn get_list(&self, key: &StorageKey) -> Result<Vec<serde_json::Value>> {
        self.inner.get_list(key)
    }

    fn modify_list(
        &self,
        key: &StorageKey,
        modify: &mut dyn FnMut(&mut Vec<serde_json::Value>) -> bool,
    ) -> Result<bool> {
        self.inner.modify_list(key, modify)
    }

    fn delete(&self, key: &StorageKey) -> Result<()> {
        self.inner.delete(key)
    }

    fn get(&self, key: &StorageKey) -> Result<Option<serde_json::Value>> {
        self.inner.get(key)
    }

    fn set(&self, key: &StorageKey, value: serde_json::Value) -> Result<()> {
        self.inner.set(key, value)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.subscribe()
    }
}

struct Exploding;

impl Dispatcher for Exploding {
    fn execute(&self, _: &Task) {
        panic!("dispatcher exploded");
    }
}

fn counting_dispatcher(counter: &Arc<AtomicUsize>) -> Arc<dyn Dispatcher> {
    let counter = Arc::clone(counter);
    Arc::new(move |_: &Task| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// Add and enumerate
// ---------------------------------------------------------------------------

#[test]
fn added_task_appears_exactly_once_and_not_processed() {
    let store = TaskStore::in_memory(options());
    let t = task("work");
    store.add(&t).unwrap();

    let matching = store.filter(|x| x.id == t.id).unwrap();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].state, TaskState::Created);
    assert!(store.processed().unwrap().is_empty());
}

#[test]
fn enumeration_keeps_storage_order() {
    let store = TaskStore::in_memory(options());
    let ids: Vec<_> = (0..5)
        .map(|_| {
            let t = task("work");
            store.add(&t).unwrap();
            t.id
        })
        .collect();

    let stored: Vec<_> = store.tasks().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(stored, ids);
}

#[test]
fn queries_by_state_and_name() {
    let store = TaskStore::in_memory(options());
    let named = task("work").with_name("nightly");
    store.add(&named).unwrap();
    store.add(&task("work")).unwrap();
    store.transition(named.id, TaskState::InProcess).unwrap();

    assert_eq!(store.count(|t| t.state == TaskState::Created).unwrap(), 1);
    assert_eq!(store.by_name("nightly").unwrap().len(), 1);
    assert_eq!(
        store.find(|t| t.state == TaskState::InProcess).unwrap().map(|t| t.id),
        Some(named.id)
    );
    assert!(store.all(|t| t.body.function() == "work").unwrap());
}

#[test]
fn stores_with_different_names_do_not_share_tasks() {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let a = TaskStore::new(options().with_server_name("a"), Arc::clone(&storage));
    let b = TaskStore::new(options().with_server_name("b"), storage);

    a.add(&task("work")).unwrap();
    assert_eq!(a.tasks().unwrap().len(), 1);
    assert!(b.tasks().unwrap().is_empty());
}

#[test]
fn clear_removes_every_task() {
    let store = TaskStore::in_memory(options());
    store.add(&task("work")).unwrap();
    store.add(&task("work")).unwrap();
    store.clear().unwrap();
    assert!(store.tasks().unwrap().is_empty());
}

#[test]
fn get_unknown_task_is_not_found() {
    let store = TaskStore::in_memory(options());
    assert!(matches!(
        store.get(broadcast_rs::TaskId::new()),
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// State transitions
// ---------------------------------------------------------------------------

#[test]
fn transitions_follow_the_lifecycle() {
    let store = TaskStore::in_memory(options());
    let t = task("work");
    store.add(&t).unwrap();

    let (from, _) = store.transition(t.id, TaskState::InProcess).unwrap();
    assert_eq!(from, TaskState::Created);
    assert!(matches!(
        store.transition(t.id, TaskState::Created),
        Err(Error::InvalidTransition { .. })
    ));
    store.transition(t.id, TaskState::Processed).unwrap();
    assert_eq!(store.get(t.id).unwrap().state, TaskState::Processed);
}

#[test]
fn deleted_is_terminal() {
    let store = TaskStore::in_memory(options());
    let t = task("work");
    store.add(&t).unwrap();

    assert!(store.delete(t.id).unwrap());
    assert!(store.delete(t.id).unwrap());
    assert!(store.transition(t.id, TaskState::InProcess).is_err());
    assert_eq!(store.get(t.id).unwrap().state, TaskState::Deleted);
    assert!(!store.delete(broadcast_rs::TaskId::new()).unwrap());
}

#[test]
fn get_finds_a_task_next_to_an_undecodable_entry() {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let store = TaskStore::new(options(), Arc::clone(&storage));
    storage
        .add_to_list(&StorageKey::tasks("store-test"), json!({"id": "garbage"}))
        .unwrap();
    let t = task("work");
    store.add(&t).unwrap();

    assert_eq!(store.get(t.id).unwrap().id, t.id);
    assert!(matches!(
        store.get(broadcast_rs::TaskId::new()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn failed_update_writes_nothing() {
    let store = TaskStore::in_memory(options());
    let t = task("work");
    store.add(&t).unwrap();

    let result = store.update(t.id, |task| {
        task.args = json!("changed");
        Err(Error::Validation("rejected".into()))
    });
    assert!(result.is_err());
    assert_eq!(store.get(t.id).unwrap().args, json!(null));
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

#[test]
fn every_registered_dispatcher_sees_every_add() {
    let store = TaskStore::in_memory(options());
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    store.register_dispatchers("one", vec![counting_dispatcher(&first)]);
    store.register_dispatchers("two", vec![counting_dispatcher(&second)]);

    store.add(&task("work")).unwrap();
    store.add(&task("work")).unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 2);
    assert_eq!(second.load(Ordering::SeqCst), 2);
}

#[test]
fn dispatchers_run_after_the_write() {
    let store = Arc::new(TaskStore::in_memory(options()));
    let seen_state = Arc::new(Mutex::new(None));
    let (s, seen) = (Arc::clone(&store), Arc::clone(&seen_state));
    store.register_dispatchers(
        "observer",
        vec![Arc::new(move |t: &Task| {
            *seen.lock().unwrap() = s.get(t.id).ok().map(|t| t.state);
        })],
    );

    store.add(&task("work")).unwrap();
    assert_eq!(*seen_state.lock().unwrap(), Some(TaskState::Created));
}

#[test]
fn reregistering_replaces_and_unregistering_removes() {
    let store = TaskStore::in_memory(options());
    let old = Arc::new(AtomicUsize::new(0));
    let new = Arc::new(AtomicUsize::new(0));

    store.register_dispatchers("group", vec![counting_dispatcher(&old)]);
    store.register_dispatchers("group", vec![counting_dispatcher(&new)]);
    store.add(&task("work")).unwrap();
    assert_eq!(old.load(Ordering::SeqCst), 0);
    assert_eq!(new.load(Ordering::SeqCst), 1);

    store.unregister_dispatchers("group");
    store.add(&task("work")).unwrap();
    assert_eq!(new.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_write_dispatches_nothing() {
    let storage = Arc::new(FlakyStorage {
        inner: InMemoryStorage::new(),
        fail_appends: AtomicBool::new(true),
    });
    let store = TaskStore::new(options(), storage.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    store.register_dispatchers("counter", vec![counting_dispatcher(&calls)]);

    assert!(matches!(store.add(&task("work")), Err(Error::Storage(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    storage.fail_appends.store(false, Ordering::SeqCst);
    store.add(&task("work")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_dispatcher_does_not_stop_the_others() {
    let store = TaskStore::in_memory(options());
    let mut events = store.events().subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    store.register_dispatchers("bad", vec![Arc::new(Exploding)]);
    store.register_dispatchers("good", vec![counting_dispatcher(&calls)]);

    store.add(&task("work")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let EventKind::DispatcherFailed {
            registration,
            error,
            ..
        } = event.kind
        {
            assert_eq!(registration, "bad");
            assert_eq!(error, "dispatcher exploded");
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[test]
fn concurrent_adds_are_all_stored_and_dispatched() {
    let store = Arc::new(TaskStore::in_memory(options()));
    let calls = Arc::new(AtomicUsize::new(0));
    store.register_dispatchers("counter", vec![counting_dispatcher(&calls)]);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    store.add(&task("work")).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(store.tasks().unwrap().len(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 200);
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[test]
fn propagate_server_upserts() {
    let store = TaskStore::in_memory(options());
    let first = Utc::now() - TimeDelta::seconds(5);
    store.propagate_server(ServerModel {
        id: "a".into(),
        heartbeat: first,
    });
    let second = Utc::now();
    store.propagate_server(ServerModel {
        id: "a".into(),
        heartbeat: second,
    });

    let servers = store.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].heartbeat, second);
}

#[test]
fn out_of_date_heartbeat_does_not_roll_back() {
    let store = TaskStore::in_memory(options());
    let newer = Utc::now();
    store.propagate_server(ServerModel {
        id: "a".into(),
        heartbeat: newer,
    });
    store.propagate_server(ServerModel {
        id: "a".into(),
        heartbeat: newer - TimeDelta::seconds(1),
    });

    assert_eq!(store.servers()[0].heartbeat, newer);
}

#[test]
fn stale_server_is_evicted_by_the_next_propagation() {
    let store = TaskStore::in_memory(options().with_heartbeat_interval(Duration::from_millis(100)));
    store.propagate_server(ServerModel {
        id: "a".into(),
        heartbeat: Utc::now(),
    });
    assert_eq!(store.servers().len(), 1);

    std::thread::sleep(Duration::from_millis(200));
    // Nothing is evicted until the next heartbeat arrives.
    assert_eq!(store.servers().len(), 1);

    store.propagate_server(ServerModel {
        id: "b".into(),
        heartbeat: Utc::now(),
    });
    let ids: Vec<_> = store.servers().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["b".to_string()]);
}
