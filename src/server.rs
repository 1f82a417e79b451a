//! The assembled task server.
//!
//! A [`Server`] owns one [`TaskStore`] scope and everything that drives it:
//! the execution dispatcher, the timer sweep and the heartbeat loops. It is
//! built explicitly with [`Server::builder`] and must be started inside a
//! tokio runtime.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Options;
use crate::error::{Error, Result, TaskError};
use crate::event::{Event, EventBus};
use crate::functions::FunctionRegistry;
use crate::membership;
use crate::model::{Schedule, ServerModel, SubmitOptions, Task, TaskId};
use crate::notification::{NotificationHandlers, Notify};
use crate::processor::{ProcessOutcome, Processor};
use crate::scheduler::Scheduler;
use crate::storage::{InMemoryStorage, Storage};
use crate::store::{Dispatcher, TaskStore};

const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Routes added tasks: immediate ones to the processor, timed ones to the
/// scheduler's timer heap.
struct ExecutionDispatcher {
    processor: Weak<Processor>,
    scheduler: Weak<Scheduler>,
}

impl Dispatcher for ExecutionDispatcher {
    fn execute(&self, task: &Task) {
        match task.schedule {
            Schedule::Immediate => {
                if let Some(processor) = self.processor.upgrade() {
                    processor.spawn(task.clone());
                }
            }
            Schedule::At { .. } | Schedule::Every { .. } => {
                if let Some(scheduler) = self.scheduler.upgrade() {
                    scheduler.arm(task);
                }
            }
        }
    }
}

pub struct ServerBuilder {
    options: Options,
    storage: Option<Arc<dyn Storage>>,
    functions: FunctionRegistry,
    handlers: NotificationHandlers,
    events: EventBus,
}

impl ServerBuilder {
    /// Use `storage` instead of a fresh in-memory store. Servers sharing a
    /// storage see each other's heartbeats.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn function<A, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: serde::de::DeserializeOwned + 'static,
        F: Fn(A) -> std::result::Result<(), TaskError> + Send + Sync + 'static,
    {
        self.functions.register(name, f);
        self
    }

    pub fn notifying_function<A, N, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: serde::de::DeserializeOwned + 'static,
        N: Notify,
        F: Fn(A) -> std::result::Result<N, TaskError> + Send + Sync + 'static,
    {
        self.functions.register_notifying(name, f);
        self
    }

    pub fn handler<N, F>(self, handler: F) -> Self
    where
        N: Notify,
        F: Fn(N) -> std::result::Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.register(handler);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Start the server on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails on invalid options or when called outside a runtime.
    pub fn start(self) -> Result<Server> {
        self.options.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("server must start inside a tokio runtime: {e}")))?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let store = Arc::new(
            TaskStore::new(self.options.clone(), Arc::clone(&storage)).with_events(self.events),
        );
        let handlers = Arc::new(self.handlers);
        let processor = Arc::new(Processor::new(
            Arc::clone(&store),
            Arc::new(self.functions),
            Arc::clone(&handlers),
            runtime.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&processor)));

        let execution: Arc<dyn Dispatcher> = Arc::new(ExecutionDispatcher {
            processor: Arc::downgrade(&processor),
            scheduler: Arc::downgrade(&scheduler),
        });
        store.register_dispatchers(self.options.server_name.clone(), vec![execution]);

        let (shutdown, signal) = watch::channel(false);
        // Subscribe before the first heartbeat so it is not missed.
        let heartbeats = storage.subscribe();
        let mut loops = vec![
            runtime.spawn(Arc::clone(&scheduler).run(signal.clone())),
            runtime.spawn(membership::listen(Arc::clone(&store), heartbeats, signal.clone())),
        ];
        let period = (self.options.heartbeat_interval / 2).max(MIN_HEARTBEAT_PERIOD);
        loops.push(runtime.spawn(membership::beat(
            Arc::clone(&storage),
            self.options.server_name.clone(),
            period,
            signal,
        )));

        info!(server = %self.options.server_name, "server started");
        Ok(Server {
            options: self.options,
            store,
            processor,
            scheduler,
            handlers,
            shutdown,
            loops: Mutex::new(loops),
        })
    }
}

/// A running task server.
pub struct Server {
    options: Options,
    store: Arc<TaskStore>,
    processor: Arc<Processor>,
    scheduler: Arc<Scheduler>,
    handlers: Arc<NotificationHandlers>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(options: Options) -> ServerBuilder {
        ServerBuilder {
            options,
            storage: None,
            functions: FunctionRegistry::new(),
            handlers: NotificationHandlers::new(),
            events: EventBus::default(),
        }
    }

    /// This server's name: its task scope and membership id.
    pub fn id(&self) -> &str {
        &self.options.server_name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Submit `function` with `args`. See [`Scheduler::submit`].
    pub fn submit<A: Serialize>(
        &self,
        function: &str,
        args: A,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let args = serde_json::to_value(args)
            .map_err(|e| Error::Validation(format!("arguments are not serializable: {e}")))?;
        self.scheduler.submit(function, args, options)
    }

    /// Run a stored task inline on the calling thread.
    pub fn process(&self, task: &Task) -> Result<ProcessOutcome> {
        self.processor.process(task)
    }

    pub fn delete_task(&self, id: TaskId) -> Result<bool> {
        self.scheduler.delete_task(id)
    }

    pub fn delete_recurring_task(&self, name: &str) -> Result<bool> {
        self.scheduler.delete_recurring_task(name)
    }

    pub fn task(&self, id: TaskId) -> Result<Task> {
        self.store.get(id)
    }

    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.store.tasks()
    }

    pub fn processed_tasks(&self) -> Result<Vec<Task>> {
        self.store.processed()
    }

    /// Membership snapshot.
    pub fn servers(&self) -> Vec<ServerModel> {
        self.store.servers()
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Handlers can be added while the server runs.
    pub fn handlers(&self) -> &NotificationHandlers {
        &self.handlers
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.store.events().subscribe()
    }

    /// Wait for every task already running when this is called. Timers that
    /// have not fired yet and work started meanwhile are not waited for.
    pub async fn wait_all(&self) {
        self.processor.wait_all().await;
    }

    /// Stop dispatching, stop the background loops and let running tasks
    /// finish. Stored tasks are left as they are.
    pub async fn shutdown(&self) {
        info!(server = %self.options.server_name, "server shutting down");
        self.store.unregister_dispatchers(&self.options.server_name);
        let _ = self.shutdown.send(true);

        let loops: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        self.processor.wait_all().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.options.server_name)
            .field("processor", &self.processor)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
