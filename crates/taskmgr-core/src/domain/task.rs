//! Task instances: what callers schedule and what the store hands back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::interval::Interval;
use super::token::ConcurrencyToken;

/// Persisted status of a task instance.
///
/// State transitions:
/// - Idle -> Running (claimed; `run_at` becomes the lease expiry)
/// - Running -> Idle (rescheduled after success or a retryable failure)
/// - Running -> Failed (retries exhausted; kept for inspection)
/// - Running -> (deleted) (one-off success)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
        }
    }
}

/// An unsaved task, as submitted to `schedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    /// Caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub task_type: String,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
    #[serde(default = "empty_object")]
    pub state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TaskInstance {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            params: empty_object(),
            state: empty_object(),
            scheduled_at: None,
            run_at: None,
            interval: None,
            user: None,
            scope: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_scope(mut self, scope: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scope = Some(scope.into_iter().map(Into::into).collect());
        self
    }
}

/// A task instance as persisted by the `TaskStore`.
///
/// Only the store creates these. The `token` must travel with every write;
/// an instance with a stale token can no longer be updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcreteTaskInstance {
    pub id: TaskId,
    pub token: ConcurrencyToken,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    pub attempts: u32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}
