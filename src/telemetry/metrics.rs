//! Metric instrument factories for broadcast-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider these are no-ops. All instruments are created lazily
//! from the `"broadcast-rs"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for broadcast-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("broadcast-rs")
}

/// Counter: tasks submitted.
/// Labels: `schedule` ("immediate" | "delayed" | "recurring"), `result` ("created" | "updated").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("broadcast.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("broadcast.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: task function invocations that failed or panicked.
/// Labels: `function`.
pub fn invocation_failures() -> Counter<u64> {
    meter()
        .u64_counter("broadcast.tasks.invocation_failures")
        .with_description("Task invocations that raised an error")
        .build()
}

/// Counter: notification handlers that failed or panicked.
/// Labels: `kind`.
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("broadcast.notifications.handler_failures")
        .with_description("Notification handlers that raised an error")
        .build()
}

/// Counter: servers dropped from the membership view for stale heartbeats.
pub fn servers_evicted() -> Counter<u64> {
    meter()
        .u64_counter("broadcast.servers.evicted")
        .with_description("Servers evicted from the membership view")
        .build()
}
