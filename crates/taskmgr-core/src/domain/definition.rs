//! Task definitions: handler factories plus per-type policy.
//!
//! # 設計
//! - 構成中 (Configuring) だけ変更可能
//! - Operating に入ったら読み取り専用で共有
//! - 一括登録は all-or-nothing。重複 type が 1 つでもあればバッチ全体を拒否し、既存の定義は触らない

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::RunContext;
use super::errors::{HandlerError, TaskManagerError};
use super::interval::Interval;

/// One execution of a task, created fresh for every run.
///
/// `run` returns raw JSON (see `RunResult::from_output`) or an error; errors
/// are recorded on the task and retried with backoff.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self) -> Result<Option<serde_json::Value>, HandlerError>;

    /// Best-effort cancellation. `None` means the handler cannot be cancelled.
    async fn cancel(&self) -> Option<Result<(), HandlerError>> {
        None
    }
}

/// Builds a handler from the context produced by the `before_run` chain.
pub trait TaskHandlerFactory: Send + Sync {
    fn create(&self, context: RunContext) -> Arc<dyn TaskHandler>;
}

impl<F> TaskHandlerFactory for F
where
    F: Fn(RunContext) -> Arc<dyn TaskHandler> + Send + Sync,
{
    fn create(&self, context: RunContext) -> Arc<dyn TaskHandler> {
        self(context)
    }
}

pub const DEFAULT_TIMEOUT_MINUTES: u32 = 5;

#[derive(Clone)]
pub struct TaskDefinition {
    task_type: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Lease length: a claimed run is presumed stalled after this long.
    pub timeout: Interval,
    /// Concurrent runs of this type allowed in one process.
    pub num_workers: usize,
    factory: Arc<dyn TaskHandlerFactory>,
}

impl TaskDefinition {
    pub fn new(factory: impl TaskHandlerFactory + 'static) -> Self {
        Self {
            task_type: String::new(),
            title: None,
            description: None,
            timeout: Interval::minutes(DEFAULT_TIMEOUT_MINUTES),
            num_workers: 1,
            factory: Arc::new(factory),
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn timeout(mut self, timeout: Interval) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set when the definition is registered under its map key.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn create_handler(&self, context: RunContext) -> Arc<dyn TaskHandler> {
        self.factory.create(context)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("title", &self.title)
            .field("timeout", &self.timeout)
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

/// Validate a batch and apply worker limits.
///
/// `num_workers = min(max_workers, override_num_workers[type] ?? num_workers)`.
pub fn sanitize_task_definitions(
    definitions: HashMap<String, TaskDefinition>,
    max_workers: usize,
    override_num_workers: &HashMap<String, usize>,
) -> Result<Vec<TaskDefinition>, TaskManagerError> {
    let mut sanitized = Vec::with_capacity(definitions.len());
    // sorted so validation errors are deterministic
    let definitions: BTreeMap<_, _> = definitions.into_iter().collect();
    for (task_type, mut definition) in definitions {
        if task_type.trim().is_empty() {
            return Err(TaskManagerError::Validation(
                "task type must not be empty".to_string(),
            ));
        }
        if definition.num_workers == 0 {
            return Err(TaskManagerError::Validation(format!(
                "task type \"{task_type}\" must allow at least one worker"
            )));
        }
        if definition.timeout.is_zero() {
            return Err(TaskManagerError::Validation(format!(
                "task type \"{task_type}\" must have a non-zero timeout"
            )));
        }
        let requested = override_num_workers
            .get(&task_type)
            .copied()
            .unwrap_or(definition.num_workers);
        definition.num_workers = requested.min(max_workers).max(1);
        definition.task_type = task_type;
        sanitized.push(definition);
    }
    Ok(sanitized)
}

/// Registered definitions, keyed by task type.
#[derive(Debug, Default, Clone)]
pub struct TaskDefinitions {
    definitions: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sanitized batch. Rejects the batch if any type exists.
    pub fn register_all(&mut self, batch: Vec<TaskDefinition>) -> Result<(), TaskManagerError> {
        if let Some(duplicate) = batch
            .iter()
            .find(|d| self.definitions.contains_key(d.task_type()))
        {
            return Err(TaskManagerError::DuplicateTaskDefinition(
                duplicate.task_type().to_string(),
            ));
        }
        for definition in batch {
            self.definitions
                .insert(definition.task_type.clone(), Arc::new(definition));
        }
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<TaskDefinition>> {
        self.definitions.get(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
