//! Typed search requests understood by every `DocumentStore`.
//!
//! A backend translates `TaskFilter` and `Sort` into its own query language.
//! `TaskFilter::matches` and `SortField::value_of` define the reference
//! semantics (the in-memory store evaluates them directly).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskDocument, TaskId, TaskStatus};

/// Conjunction of optional predicates over a task document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskFilter {
    pub ids: Option<Vec<TaskId>>,
    pub task_types: Option<Vec<String>>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub exclude_statuses: Vec<TaskStatus>,
    pub max_attempts: Option<u32>,
    pub run_at_lte: Option<DateTime<Utc>>,
    pub max_api_version: Option<u32>,
    /// Matches documents whose scope list contains this entry.
    pub scope: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, doc: &TaskDocument) -> bool {
        let task = &doc.task;
        self.ids.as_ref().is_none_or(|ids| ids.contains(&doc.id))
            && self
                .task_types
                .as_ref()
                .is_none_or(|types| types.contains(&task.task_type))
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&task.status))
            && !self.exclude_statuses.contains(&task.status)
            && self.max_attempts.is_none_or(|max| task.attempts <= max)
            && self.run_at_lte.is_none_or(|at| task.run_at <= at)
            && self
                .max_api_version
                .is_none_or(|max| doc.metadata.api_version <= max)
            && self.scope.as_ref().is_none_or(|wanted| {
                task.scope
                    .as_ref()
                    .is_some_and(|scope| scope.iter().any(|s| s == wanted))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Id,
    TaskType,
    ScheduledAt,
    RunAt,
    Attempts,
    Status,
}

impl SortField {
    pub fn value_of(self, doc: &TaskDocument) -> SortValue {
        match self {
            SortField::Id => SortValue::Text(doc.id.as_str().to_string()),
            SortField::TaskType => SortValue::Text(doc.task.task_type.clone()),
            SortField::ScheduledAt => SortValue::Time(doc.task.scheduled_at),
            SortField::RunAt => SortValue::Time(doc.task.run_at),
            SortField::Attempts => SortValue::Number(i64::from(doc.task.attempts)),
            SortField::Status => SortValue::Text(doc.task.status.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            order: SortOrder::Desc,
        }
    }
}

/// One component of a hit's sort key; also the pagination cursor format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Number(i64),
    Time(DateTime<Utc>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub filter: TaskFilter,
    pub sort: Vec<Sort>,
    pub size: usize,
    /// Return only hits that sort strictly after this key.
    pub search_after: Option<Vec<SortValue>>,
}
