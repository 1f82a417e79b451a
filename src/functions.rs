//! Registry of invokable task functions.
//!
//! A task never carries code. Its body names a function registered here
//! and its arguments are a JSON snapshot, so every stored task stays
//! inspectable and could be persisted by a durable backend.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{TaskError, panic_message};
use crate::model::TaskBody;
use crate::notification::{Notification, Notify};

/// Type-erased task function.
pub type TaskFunction =
    Arc<dyn Fn(&serde_json::Value) -> Result<Option<Notification>, TaskError> + Send + Sync>;

/// Functions a server can run, keyed by stable name.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function whose result is not routed anywhere.
    pub fn register<A, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.register_raw(name, move |args| {
            f(decode_args(args)?)?;
            Ok(None)
        })
    }

    /// Register a function whose result is a notification for the handlers
    /// registered under `N::KIND`.
    pub fn register_notifying<A, N, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        N: Notify,
        F: Fn(A) -> Result<N, TaskError> + Send + Sync + 'static,
    {
        self.register_raw(name, move |args| {
            let output = f(decode_args(args)?)?;
            let notification = Notification::new(&output)
                .map_err(|e| TaskError::Failed(format!("cannot encode notification: {e}")))?;
            Ok(Some(notification))
        })
    }

    /// Register an untyped function. Replaces any function with that name.
    pub fn register_raw<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Option<Notification>, TaskError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Run `body` with `args`. Errors and panics come back as [`TaskError`].
    pub fn invoke(
        &self,
        body: &TaskBody,
        args: &serde_json::Value,
    ) -> Result<Option<Notification>, TaskError> {
        let function = self
            .functions
            .get(body.function())
            .ok_or_else(|| TaskError::UnknownFunction(body.function().to_string()))?;

        catch_unwind(AssertUnwindSafe(|| function(args)))
            .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))))
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

fn decode_args<A: DeserializeOwned>(args: &serde_json::Value) -> Result<A, TaskError> {
    A::deserialize(args).map_err(|e| TaskError::Arguments(e.to_string()))
}
