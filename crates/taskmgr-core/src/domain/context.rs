//! Contexts threaded through the middleware chain.
//!
//! `extensions` is the accumulator middleware stages use to pass data along
//! (request-scoped credentials, tracing ids, ...). The scheduler itself never
//! reads it.

use serde_json::{Map, Value};

use super::task::{ConcreteTaskInstance, TaskInstance};

/// Input to `before_save`, built from `schedule(instance, opts)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleContext {
    pub task_instance: TaskInstance,
    pub extensions: Map<String, Value>,
}

impl ScheduleContext {
    pub fn new(task_instance: TaskInstance, options: ScheduleOptions) -> Self {
        Self {
            task_instance,
            extensions: options.extensions,
        }
    }
}

/// Caller-supplied extras for `schedule`, copied into the `ScheduleContext`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleOptions {
    pub extensions: Map<String, Value>,
}

impl ScheduleOptions {
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }
}

/// Input to `before_run`; the final value is handed to the handler factory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub task_instance: ConcreteTaskInstance,
    pub extensions: Map<String, Value>,
}

impl RunContext {
    pub fn new(task_instance: ConcreteTaskInstance) -> Self {
        Self {
            task_instance,
            extensions: Map::new(),
        }
    }
}
