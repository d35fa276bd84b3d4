use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::PoolError;

/// Work a pool worker can run for one task type.
///
/// Returning `Err` fails only the task; the worker stays in the pool.
/// Panicking is treated as a worker fault: the worker is discarded and
/// replaced if the pool falls below its minimum size.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> anyhow::Result<Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        self(payload)
    }
}

/// Task types known to a pool, fixed at construction.
///
/// Submitting a task type that is not registered fails immediately with
/// [`PoolError::UnknownTaskType`] before anything is queued.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Arc<str>, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns error if the task type is already registered.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler,
    ) -> Result<(), PoolError> {
        let task_type: Arc<str> = Arc::from(task_type.into());
        if self.handlers.contains_key(&task_type) {
            return Err(PoolError::DuplicateHandler(task_type.to_string()));
        }
        self.handlers.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Chaining form of [`HandlerRegistry::register`].
    pub fn with(
        mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler,
    ) -> Result<Self, PoolError> {
        self.register(task_type, handler)?;
        Ok(self)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task type names, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Interned name for a registered task type.
    pub(crate) fn resolve(&self, task_type: &str) -> Result<Arc<str>, PoolError> {
        self.handlers
            .get_key_value(task_type)
            .map(|(name, _)| Arc::clone(name))
            .ok_or_else(|| PoolError::UnknownTaskType(task_type.to_string()))
    }

    pub(crate) fn invoke(&self, task_type: &str, payload: Value) -> anyhow::Result<Value> {
        match self.handlers.get(task_type) {
            Some(handler) => handler.handle(payload),
            None => anyhow::bail!("no handler for task type '{task_type}'"),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
