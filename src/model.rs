//! Core data model.
//!
//! A task is one schedulable unit of work. It has identity, an invokable
//! body with its argument snapshot, a schedule, and lifecycle state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Never changes once assigned.
    pub id: TaskId,

    /// Identity key for named recurring tasks.
    pub name: Option<String>,

    /// Which registered function runs this task.
    pub body: TaskBody,

    /// Argument snapshot handed to the function at execution time.
    pub args: serde_json::Value,

    /// When the task runs.
    pub schedule: Schedule,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Id of the first occurrence of the recurring chain this task belongs
    /// to. `None` for that first occurrence and for one-off tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_id: Option<TaskId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(body: TaskBody, args: serde_json::Value, schedule: Schedule) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: None,
            body,
            args,
            schedule,
            state: TaskState::Created,
            recurring_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.schedule, Schedule::Every { .. })
    }

    /// The id shared by every occurrence of a recurring chain: the id the
    /// chain was submitted under.
    pub fn lineage(&self) -> TaskId {
        self.recurring_id.unwrap_or(self.id)
    }

    /// The fresh record for the next run of a recurring slot: new identity,
    /// same name, lineage, body, arguments and interval.
    pub fn next_occurrence(&self) -> Self {
        let mut next = Task::new(self.body.clone(), self.args.clone(), self.schedule.clone());
        next.name = self.name.clone();
        next.recurring_id = Some(self.lineage());
        next
    }

    /// Move to `to`, or fail if the lifecycle forbids it.
    pub fn transition(&mut self, to: TaskState) -> crate::error::Result<TaskState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(crate::error::Error::InvalidTransition { from, to });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(from)
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Reference to a function in the [`FunctionRegistry`](crate::functions::FunctionRegistry).
///
/// Bodies compare by function name, which is what lets a named recurring
/// registration recognise and replace its previous body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskBody(pub String);

impl TaskBody {
    pub fn new(function: impl Into<String>) -> Self {
        Self(function.into())
    }

    pub fn function(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// When a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// As soon as a worker is free.
    Immediate,
    /// Once, at an absolute instant.
    At { due: DateTime<Utc> },
    /// Repeatedly, every interval, until deleted.
    Every {
        #[serde(with = "duration_nanos")]
        interval: Duration,
    },
}

/// Intervals are stored as whole nanoseconds so they read back exactly.
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer, ser::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(d.as_nanos())
            .map_err(|_| S::Error::custom(format!("interval {d:?} is out of range")))?;
        s.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Stored, waiting to run.
    Created,
    /// A worker is invoking it.
    InProcess,
    /// Ran to the end, successfully or not.
    Processed,
    /// Cancelled. Terminal.
    Deleted,
}

impl TaskState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Created, InProcess)
                | (InProcess, Processed)
                | (Created, Deleted)
                | (InProcess, Deleted)
                | (Processed, Deleted)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Deleted)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::InProcess => "in_process",
            TaskState::Processed => "processed",
            TaskState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskState::Created),
            "in_process" => Ok(TaskState::InProcess),
            "processed" => Ok(TaskState::Processed),
            "deleted" => Ok(TaskState::Deleted),
            _ => Err(crate::error::Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Recurring reference
// ---------------------------------------------------------------------------

/// Named slot pointing at the active occurrence of a recurring task.
///
/// Stored at `tasks:recurring:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecurringReference {
    pub name: String,
    pub reference_id: TaskId,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// A server instance as seen by the membership view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerModel {
    pub id: String,
    /// Last time this server reported in.
    pub heartbeat: DateTime<Utc>,
}

/// The liveness record a server writes through storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatRecord {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<HeartbeatRecord> for ServerModel {
    fn from(record: HeartbeatRecord) -> Self {
        Self {
            id: record.server_id,
            heartbeat: record.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Options for submitting work. Defaults to immediate execution.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub(crate) delay: Option<Duration>,
    pub(crate) interval: Option<Duration>,
    pub(crate) name: Option<String>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run once, after `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run every `interval` until deleted.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Name a recurring task. Resubmitting under the same name updates it.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
