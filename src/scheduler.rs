//! Submission and timed execution.
//!
//! [`Scheduler::submit`] turns a function name, arguments and
//! [`SubmitOptions`] into a stored task. Delayed and recurring tasks are
//! armed on a timer heap; a single sweep loop hands due tasks to the
//! [`Processor`]. Each recurring occurrence is its own task record: when one
//! finishes, the next is added with a fresh id and the named reference (if
//! any) moves to it. Every occurrence remembers the id its chain was
//! submitted under, so deleting that id stops the chain.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{
    RecurringReference, Schedule, SubmitOptions, Task, TaskBody, TaskId, TaskState,
};
use crate::processor::Processor;
use crate::storage::{StorageExt, StorageKey};
use crate::store::TaskStore;
use crate::telemetry::metrics;

pub struct Scheduler {
    store: Arc<TaskStore>,
    processor: Arc<Processor>,
    timers: Mutex<BinaryHeap<Reverse<(Instant, TaskId)>>>,
    wake: Notify,
    /// Serializes every read-modify-write of recurring references.
    recurring: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, processor: Arc<Processor>) -> Self {
        Self {
            store,
            processor,
            timers: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            recurring: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Store a task for `function` and return its id.
    ///
    /// Resubmitting a named recurring task whose current occurrence is still
    /// live updates that occurrence in place and returns its id.
    pub fn submit(
        &self,
        function: &str,
        args: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        self.validate(function, &options)?;
        let body = TaskBody::new(function);

        let (task, kind) = match (options.delay, options.interval, options.name) {
            (None, None, _) => (Task::new(body, args, Schedule::Immediate), "immediate"),
            (Some(delay), None, _) => {
                let due = chrono::TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .ok_or_else(|| Error::Validation(format!("delay {delay:?} is out of range")))?;
                (Task::new(body, args, Schedule::At { due }), "delayed")
            }
            (None, Some(interval), Some(name)) => {
                return self.submit_named(name, body, args, interval);
            }
            (None, Some(interval), None) => {
                (Task::new(body, args, Schedule::Every { interval }), "recurring")
            }
            (Some(_), Some(_), _) => {
                return Err(Error::Validation(
                    "a task is either delayed or recurring, not both".to_string(),
                ));
            }
        };

        self.store.add(&task)?;
        metrics::tasks_submitted().add(
            1,
            &[
                opentelemetry::KeyValue::new("schedule", kind),
                opentelemetry::KeyValue::new("result", "created"),
            ],
        );
        Ok(task.id)
    }

    fn validate(&self, function: &str, options: &SubmitOptions) -> Result<()> {
        if !self.processor.functions().contains(function) {
            return Err(Error::Validation(format!(
                "function `{function}` is not registered"
            )));
        }
        if options.delay.is_some() && options.interval.is_some() {
            return Err(Error::Validation(
                "a task is either delayed or recurring, not both".to_string(),
            ));
        }
        if let Some(interval) = options.interval {
            if interval.is_zero() {
                return Err(Error::Validation("interval must be positive".to_string()));
            }
            if u64::try_from(interval.as_nanos()).is_err() {
                return Err(Error::Validation(format!(
                    "interval {interval:?} is out of range"
                )));
            }
        }
        match &options.name {
            Some(_) if options.interval.is_none() => Err(Error::Validation(
                "only recurring tasks can be named".to_string(),
            )),
            Some(name) if name.trim().is_empty() => {
                Err(Error::Validation("task name must not be empty".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn submit_named(
        &self,
        name: String,
        body: TaskBody,
        args: serde_json::Value,
        interval: Duration,
    ) -> Result<TaskId> {
        let _slot = self.recurring.lock().unwrap_or_else(PoisonError::into_inner);
        let key = StorageKey::recurring(&name);

        if let Some(reference) = self.store.storage().get_as::<RecurringReference>(&key)? {
            match self.store.get(reference.reference_id) {
                Ok(current) if current.state != TaskState::Deleted => {
                    let updated = self.store.update(current.id, |task| {
                        task.body = body;
                        task.args = args;
                        task.updated_at = Utc::now();
                        Ok(())
                    })?;
                    info!(%name, id = %updated.id, "recurring task updated in place");
                    metrics::tasks_submitted().add(
                        1,
                        &[
                            opentelemetry::KeyValue::new("schedule", "recurring"),
                            opentelemetry::KeyValue::new("result", "updated"),
                        ],
                    );
                    self.store.events().publish(EventKind::RecurringUpdated {
                        name,
                        id: updated.id,
                    });
                    return Ok(updated.id);
                }
                Ok(_) | Err(Error::NotFound(_)) => {
                    debug!(%name, "recurring reference is stale, registering afresh");
                }
                Err(e) => return Err(e),
            }
        }

        let task = Task::new(body, args, Schedule::Every { interval }).with_name(&name);
        // The reference goes first so a fast first run can already find it.
        self.store.storage().set_as(
            &key,
            &RecurringReference {
                name: name.clone(),
                reference_id: task.id,
            },
        )?;
        if let Err(e) = self.store.add(&task) {
            let _ = self.store.storage().delete(&key);
            return Err(e);
        }
        info!(%name, id = %task.id, "recurring task registered");
        metrics::tasks_submitted().add(
            1,
            &[
                opentelemetry::KeyValue::new("schedule", "recurring"),
                opentelemetry::KeyValue::new("result", "created"),
            ],
        );
        Ok(task.id)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Mark one task deleted. `Ok(false)` if it does not exist.
    ///
    /// Deleting any occurrence of a recurring task stops the whole chain:
    /// the id it was submitted under and every pending or running
    /// occurrence are marked deleted as well.
    pub fn delete_task(&self, id: TaskId) -> Result<bool> {
        let _slot = self.recurring.lock().unwrap_or_else(PoisonError::into_inner);
        let task = match self.store.get(id) {
            Ok(task) => task,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.store.delete(id)?;
        info!(%id, "task deleted");

        if task.is_recurring() {
            let lineage = task.lineage();
            let live = self.store.filter(|t| {
                t.lineage() == lineage
                    && t.id != id
                    && (t.id == lineage
                        || matches!(t.state, TaskState::Created | TaskState::InProcess))
            })?;
            for occurrence in live {
                self.store.delete(occurrence.id)?;
                debug!(id = %occurrence.id, %lineage, "recurring occurrence deleted");
            }
        }
        Ok(true)
    }

    /// Stop a named recurring task: drop its reference and mark its current
    /// occurrence deleted. `Ok(false)` if no task has that name.
    pub fn delete_recurring_task(&self, name: &str) -> Result<bool> {
        let _slot = self.recurring.lock().unwrap_or_else(PoisonError::into_inner);
        let key = StorageKey::recurring(name);
        let Some(reference) = self.store.storage().get_as::<RecurringReference>(&key)? else {
            return Ok(false);
        };

        self.store.storage().delete(&key)?;
        self.store.delete(reference.reference_id)?;
        info!(%name, id = %reference.reference_id, "recurring task deleted");
        self.store.events().publish(EventKind::RecurringDeleted {
            name: name.to_string(),
            id: reference.reference_id,
        });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Recurrence
    // -----------------------------------------------------------------------

    /// Add the occurrence after `completed`, unless the slot was deleted or
    /// has moved on. Returns the new occurrence's id.
    pub fn schedule_next(&self, completed: TaskId) -> Result<Option<TaskId>> {
        let _slot = self.recurring.lock().unwrap_or_else(PoisonError::into_inner);
        let current = match self.store.get(completed) {
            Ok(task) => task,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if current.state == TaskState::Deleted || !current.is_recurring() {
            return Ok(None);
        }
        if let Some(root) = current.recurring_id {
            match self.store.get(root) {
                Ok(first) if first.state == TaskState::Deleted => {
                    debug!(id = %current.id, %root, "recurring chain deleted, not rescheduling");
                    return Ok(None);
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let next = current.next_occurrence();
        if let Some(name) = &current.name {
            let key = StorageKey::recurring(name);
            let reference = self.store.storage().get_as::<RecurringReference>(&key)?;
            if reference.map(|r| r.reference_id) != Some(current.id) {
                debug!(%name, id = %current.id, "recurring slot moved on, not rescheduling");
                return Ok(None);
            }
            self.store.storage().set_as(
                &key,
                &RecurringReference {
                    name: name.clone(),
                    reference_id: next.id,
                },
            )?;
        }
        self.store.add(&next)?;
        debug!(previous = %current.id, next = %next.id, "next occurrence scheduled");
        Ok(Some(next.id))
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Arm a timer for a delayed or recurring task. Immediate tasks are
    /// ignored.
    pub fn arm(&self, task: &Task) {
        let delay = match &task.schedule {
            Schedule::Immediate => return,
            Schedule::At { due } => (*due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            Schedule::Every { interval } => *interval,
        };
        let due = Instant::now() + delay;
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse((due, task.id)));
        self.wake.notify_one();

        let due_at = chrono::TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or_else(Utc::now);
        debug!(id = %task.id, delay_ms = delay.as_millis() as u64, "timer armed");
        self.store
            .events()
            .publish(EventKind::TaskScheduled { id: task.id, due: due_at });
    }

    /// Number of armed timers that have not fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek()
            .map(|Reverse((due, _))| *due)
    }

    fn take_due(&self, now: Instant) -> Vec<TaskId> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = timers.peek().copied() {
            if at > now {
                break;
            }
            timers.pop();
            due.push(id);
        }
        due
    }

    /// Fire due timers until `shutdown` flips to true or its sender is gone.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        loop {
            let next = self.next_due();
            let sleep = async move {
                match next {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        return;
                    }
                    continue;
                }
                _ = self.wake.notified() => continue,
                _ = sleep => {}
            }

            for id in self.take_due(Instant::now()) {
                self.fire(id);
            }
        }
    }

    fn fire(self: &Arc<Self>, id: TaskId) {
        let task = match self.store.get(id) {
            Ok(task) => task,
            Err(e) => {
                warn!(%id, error = %e, "timer fired for unknown task");
                return;
            }
        };
        if task.state == TaskState::Deleted {
            debug!(%id, "timer fired for deleted task, skipping");
            return;
        }

        let scheduler = Arc::clone(self);
        self.processor.spawn_then(task, move |task, _outcome| {
            if !task.is_recurring() {
                return;
            }
            if let Err(e) = scheduler.schedule_next(task.id) {
                error!(id = %task.id, error = %e, "failed to schedule next occurrence");
            }
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending_timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}
