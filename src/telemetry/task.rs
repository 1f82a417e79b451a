//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through the processor.

use tracing::Span;

use crate::model::{TaskId, TaskState};

/// Start a span for one task invocation.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(function: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.process",
        "task.function" = function,
        "task.id" = %task_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record the task's current state on its span.
///
/// Counting happens in the store, which sees every transition.
pub fn record_state_transition(span: &Span, from: TaskState, to: TaskState) {
    span.record("task.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
