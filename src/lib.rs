//! # broadcast-rs
//!
//! Background task engine. Work is submitted to run immediately, after a
//! delay or on a recurring interval; it is recorded in pluggable storage,
//! fanned out to dispatchers, executed on a worker pool, and notification
//! results are routed to typed handlers. Servers sharing a storage track
//! each other through heartbeats.

pub mod config;
pub mod error;
pub mod event;
pub mod functions;
pub mod membership;
pub mod model;
pub mod notification;
pub mod processor;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use config::Options;
pub use error::{Error, HandlerError, Result, TaskError};
pub use functions::FunctionRegistry;
pub use model::{Schedule, SubmitOptions, Task, TaskBody, TaskId, TaskState};
pub use notification::{Notification, NotificationHandlers, Notify};
pub use processor::{ProcessOutcome, Processor};
pub use scheduler::Scheduler;
pub use server::{Server, ServerBuilder};
pub use storage::{InMemoryStorage, Storage, StorageExt, StorageKey};
pub use store::{Dispatcher, TaskStore};
