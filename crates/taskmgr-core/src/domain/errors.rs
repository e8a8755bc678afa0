//! Error taxonomy for the task manager.
//!
//! Conflicts and not-found results are expected races between nodes. Callers
//! that can tolerate them check `is_conflict()` / `is_not_found()` instead of
//! matching on variants.

use thiserror::Error;

use crate::ports::StoreError;

/// Boxed error returned by task handlers.
///
/// Handler errors never propagate out of the runner; they are captured into
/// `RunResult::error` and drive retry/backoff.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum TaskManagerError {
    /// Lost an optimistic-concurrency race.
    #[error("version conflict on task {id}")]
    Conflict { id: String },

    #[error("task {id} not found")]
    NotFound { id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported task type \"{task_type}\"; supported types are {}", .supported.join(", "))]
    UnsupportedTaskType {
        task_type: String,
        supported: Vec<String>,
    },

    #[error("task type \"{0}\" is already registered")]
    DuplicateTaskDefinition(String),

    #[error("cannot {operation} while the task manager is {phase}")]
    Lifecycle {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("task store has already been initialized")]
    AlreadyInitialized,

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("middleware failed: {0}")]
    Middleware(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TaskManagerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn lifecycle(operation: &'static str, phase: &'static str) -> Self {
        Self::Lifecycle { operation, phase }
    }
}

impl From<StoreError> for TaskManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id } => Self::Conflict { id },
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
        }
    }
}

pub type Result<T, E = TaskManagerError> = std::result::Result<T, E>;
