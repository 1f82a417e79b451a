//! Structured events emitted on every lifecycle step.
//!
//! Failures that processing contains (task functions, handlers,
//! dispatchers) are reported here rather than returned to whoever
//! submitted the work. Consumers subscribe to build dashboards, alerting or
//! tests that assert on contained failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{TaskId, TaskState};

const DEFAULT_CAPACITY: usize = 1024;

/// A structured engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskAdded {
        id: TaskId,
        function: String,
        name: Option<String>,
    },
    TaskScheduled {
        id: TaskId,
        due: DateTime<Utc>,
    },
    StateTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    InvocationFailed {
        id: TaskId,
        error: String,
    },
    HandlerFailed {
        id: TaskId,
        kind: String,
        index: usize,
        error: String,
    },
    DispatcherFailed {
        id: TaskId,
        registration: String,
        error: String,
    },
    TaskDeleted {
        id: TaskId,
    },
    RecurringUpdated {
        name: String,
        id: TaskId,
    },
    RecurringDeleted {
        name: String,
        id: TaskId,
    },
    ServerPropagated {
        server_id: String,
    },
    ServerEvicted {
        server_id: String,
    },
}

/// Broadcast channel for engine events.
///
/// Publishing never blocks. Slow receivers observe `RecvError::Lagged` and
/// skip the oldest events; events sent with no receivers are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
