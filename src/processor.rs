//! Task processor: runs one task through its lifecycle.
//!
//! `Created → InProcess`, invoke the function, route any notification to
//! its handlers, then `InProcess → Processed`. A task deleted before or
//! during the run stays `Deleted`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, HandlerError, Result, TaskError};
use crate::event::EventKind;
use crate::functions::FunctionRegistry;
use crate::model::{Task, TaskState};
use crate::notification::NotificationHandlers;
use crate::store::TaskStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// What happened to a task handed to [`Processor::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The task was deleted before it could start.
    Skipped,
    /// The task ran. Function and handler failures are recorded here; they
    /// never stop the lifecycle.
    Processed {
        error: Option<TaskError>,
        handler_errors: Vec<HandlerError>,
    },
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Processed { error: None, handler_errors } if handler_errors.is_empty()
        )
    }
}

pub struct Processor {
    store: Arc<TaskStore>,
    functions: Arc<FunctionRegistry>,
    handlers: Arc<NotificationHandlers>,
    runtime: Handle,
    in_flight: Arc<Tracker>,
}

impl Processor {
    pub fn new(
        store: Arc<TaskStore>,
        functions: Arc<FunctionRegistry>,
        handlers: Arc<NotificationHandlers>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            functions,
            handlers,
            runtime,
            in_flight: Arc::new(Tracker::default()),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Run `task` to completion on the calling thread.
    ///
    /// # Errors
    ///
    /// Only storage failures and tasks that are not in `Created` state are
    /// errors. Function and handler failures are part of the outcome.
    pub fn process(&self, task: &Task) -> Result<ProcessOutcome> {
        let span = start_task_span(task.body.function(), &task.id);
        let _entered = span.enter();

        let running = match self.store.transition(task.id, TaskState::InProcess) {
            Ok((from, running)) => {
                record_state_transition(&span, from, TaskState::InProcess);
                running
            }
            Err(Error::InvalidTransition {
                from: TaskState::Deleted,
                ..
            }) => {
                debug!("task deleted before it started");
                return Ok(ProcessOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let mut handler_errors = Vec::new();
        let error = match self.functions.invoke(&running.body, &running.args) {
            Ok(Some(notification)) => {
                handler_errors = self.handlers.dispatch(&notification);
                for failure in &handler_errors {
                    warn!(kind = %failure.kind, index = failure.index, error = %failure.source, "notification handler failed");
                    metrics::handler_failures()
                        .add(1, &[opentelemetry::KeyValue::new("kind", failure.kind.clone())]);
                    self.store.events().publish(EventKind::HandlerFailed {
                        id: task.id,
                        kind: failure.kind.clone(),
                        index: failure.index,
                        error: failure.source.to_string(),
                    });
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "task function failed");
                metrics::invocation_failures().add(
                    1,
                    &[opentelemetry::KeyValue::new(
                        "function",
                        running.body.function().to_string(),
                    )],
                );
                self.store.events().publish(EventKind::InvocationFailed {
                    id: task.id,
                    error: e.to_string(),
                });
                Some(e)
            }
        };

        match self.store.transition(task.id, TaskState::Processed) {
            Ok((from, _)) => record_state_transition(&span, from, TaskState::Processed),
            Err(Error::InvalidTransition {
                from: TaskState::Deleted,
                ..
            }) => debug!("task deleted while in process"),
            Err(e) => return Err(e),
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(duration_ms, failed = error.is_some(), "task processed");
        Ok(ProcessOutcome::Processed {
            error,
            handler_errors,
        })
    }

    /// Process `task` on the blocking pool.
    pub fn spawn(self: &Arc<Self>, task: Task) {
        self.spawn_then(task, |_, _| {});
    }

    /// Process `task` on the blocking pool, then call `then` with the
    /// outcome. The task counts as in flight until `then` returns.
    pub fn spawn_then<F>(self: &Arc<Self>, task: Task, then: F)
    where
        F: FnOnce(&Task, &ProcessOutcome) + Send + 'static,
    {
        let guard = InFlight::enter(&self.in_flight);
        let processor = Arc::clone(self);
        self.runtime.spawn_blocking(move || {
            let _guard = guard;
            match processor.process(&task) {
                Ok(outcome) => then(&task, &outcome),
                Err(e) => error!(id = %task.id, error = %e, "failed to process task"),
            }
        });
    }

    /// Number of spawned tasks that have not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().running.len()
    }

    /// Wait for every task spawned before this call. Work spawned while
    /// waiting is not waited for.
    pub async fn wait_all(&self) {
        let target = self.in_flight.lock().next;
        loop {
            let finished = self.in_flight.finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();
            if self.in_flight.settled_before(target) {
                return;
            }
            finished.await;
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("functions", &self.functions)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Spawned work, numbered in spawn order.
#[derive(Default)]
struct Tracker {
    tickets: Mutex<Tickets>,
    finished: Notify,
}

#[derive(Default)]
struct Tickets {
    next: u64,
    running: BTreeSet<u64>,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once every ticket below `target` has finished.
    fn settled_before(&self, target: u64) -> bool {
        self.lock().running.first().is_none_or(|&oldest| oldest >= target)
    }
}

/// Holds one ticket of in-flight work until dropped.
struct InFlight {
    ticket: u64,
    tracker: Arc<Tracker>,
}

impl InFlight {
    fn enter(tracker: &Arc<Tracker>) -> Self {
        let mut tickets = tracker.lock();
        let ticket = tickets.next;
        tickets.next += 1;
        tickets.running.insert(ticket);
        Self {
            ticket,
            tracker: Arc::clone(tracker),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tracker.lock().running.remove(&self.ticket);
        self.tracker.finished.notify_waiters();
    }
}
