//! Notification results and their handlers.
//!
//! A task function may return a [`Notification`]: a payload tagged with
//! the stable kind of the type that produced it. Handlers are registered
//! per kind and resolved by exact tag. A handler registered for one kind is
//! never offered another kind, even if the payloads happen to be compatible.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{HandlerError, TaskError, panic_message};

/// A type that can be routed to notification handlers.
pub trait Notify: Serialize + DeserializeOwned + Send + 'static {
    /// Stable tag identifying this type. Must be unique per type.
    const KIND: &'static str;
}

/// A task result to route to the handlers of its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new<N: Notify>(value: &N) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: N::KIND.to_string(),
            payload: serde_json::to_value(value)?,
        })
    }

    /// Decode the payload as `N`. Fails if the kind does not match exactly.
    pub fn decode<N: Notify>(&self) -> Result<N, TaskError> {
        if self.kind != N::KIND {
            return Err(TaskError::Arguments(format!(
                "notification kind `{}` is not `{}`",
                self.kind,
                N::KIND
            )));
        }
        N::deserialize(&self.payload).map_err(|e| TaskError::Arguments(e.to_string()))
    }
}

type Handler = Arc<dyn Fn(&Notification) -> Result<(), TaskError> + Send + Sync>;

/// Handlers keyed by notification kind, in registration order.
#[derive(Default)]
pub struct NotificationHandlers {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl NotificationHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<N, F>(&self, handler: F)
    where
        N: Notify,
        F: Fn(N) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.register_raw(N::KIND, move |notification| handler(notification.decode::<N>()?));
    }

    pub fn register_raw<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Notification) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of handlers registered for `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Run every handler of the notification's kind, in registration order.
    ///
    /// A failing or panicking handler does not stop the ones after it. The
    /// failures are returned.
    pub fn dispatch(&self, notification: &Notification) -> Vec<HandlerError> {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&notification.kind)
            .cloned()
            .unwrap_or_default();

        handlers
            .iter()
            .enumerate()
            .filter_map(|(index, handler)| {
                let result = catch_unwind(AssertUnwindSafe(|| handler(notification)))
                    .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));
                result.err().map(|source| HandlerError {
                    kind: notification.kind.clone(),
                    index,
                    source,
                })
            })
            .collect()
    }
}
