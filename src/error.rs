//! Error types for broadcast-rs.
//!
//! [`Error`] is what the store, scheduler and server surface to callers.
//! [`TaskError`] and [`HandlerError`] never leave the processor: they are
//! recorded in the [`ProcessOutcome`](crate::processor::ProcessOutcome) and
//! published as diagnostic events.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::TaskState,
        to: crate::model::TaskState,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure raised by a task function while it was being invoked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid arguments: {0}")]
    Arguments(String),

    #[error("function `{0}` is not registered")]
    UnknownFunction(String),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Failure raised by one notification handler. Other handlers of the
/// same fan-out still run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("handler #{index} for `{kind}` failed: {source}")]
pub struct HandlerError {
    pub kind: String,
    pub index: usize,
    pub source: TaskError,
}

/// Turn a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
