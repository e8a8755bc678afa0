//! Persisted document shape.
//!
//! ```json
//! { "id": "...", "type": "task",
//!   "task": { "taskType": "...", "scheduledAt": "...", "runAt": "...",
//!             "interval": "5m", "attempts": 0, "status": "idle",
//!             "params": "{...}", "state": "{...}", "user": "...", "scope": [] },
//!   "metadata": { "schemaVersion": 1, "apiVersion": 1 } }
//! ```
//!
//! `params` and `state` are stored as serialized JSON text so the backing
//! store never has to index arbitrary handler data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::interval::Interval;
use super::task::TaskStatus;

pub const TASK_DOCUMENT_TYPE: &str = "task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub task: TaskFields,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFields {
    pub task_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    pub attempts: u32,
    pub status: TaskStatus,
    pub params: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

/// Versions of the code that wrote the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub schema_version: u32,
    /// Nodes running an older API version must not touch this document.
    pub api_version: u32,
}
