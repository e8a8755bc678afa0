//! The value a handler reports back after one run.
//!
//! Handlers return loosely-typed JSON so they can be written against any
//! serialization of their own. `RunResult::from_output` is the single place
//! where that JSON is checked.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::TaskManagerError;
use super::task::empty_object;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// New task state. `None` keeps the state the task ran with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,

    /// Explicit next run; makes the task recurring for this cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,

    /// Failure message; counts as a failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for RunResult {
    fn default() -> Self {
        Self {
            state: Some(empty_object()),
            run_at: None,
            error: None,
        }
    }
}

impl RunResult {
    pub fn with_state(state: serde_json::Value) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Result synthesized for a handler that returned an error.
    pub fn failed(error: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            state: Some(state),
            run_at: None,
            error: Some(error.into()),
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Validate raw handler output.
    ///
    /// `None` and `null` mean "nothing to report" and map to the default.
    /// Accepted keys: `state` (object), `runAt` (RFC 3339 string), `error`
    /// (string, or object which is kept as its JSON text).
    pub fn from_output(output: Option<serde_json::Value>) -> Result<Self, TaskManagerError> {
        let map = match output {
            None | Some(serde_json::Value::Null) => return Ok(Self::default()),
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                return Err(TaskManagerError::Validation(format!(
                    "run result must be an object, got {other}"
                )));
            }
        };

        let mut result = Self {
            state: None,
            run_at: None,
            error: None,
        };
        for (key, value) in map {
            match (key.as_str(), value) {
                (_, serde_json::Value::Null) => {}
                ("state", state @ serde_json::Value::Object(_)) => result.state = Some(state),
                ("runAt", serde_json::Value::String(raw)) => {
                    let parsed = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
                        TaskManagerError::Validation(format!("runAt \"{raw}\" is not a date: {e}"))
                    })?;
                    result.run_at = Some(parsed.with_timezone(&Utc));
                }
                ("error", serde_json::Value::String(message)) => result.error = Some(message),
                ("error", detail @ serde_json::Value::Object(_)) => {
                    result.error = Some(detail.to_string())
                }
                (key, value) => {
                    return Err(TaskManagerError::Validation(format!(
                        "unexpected run result field {key}={value}"
                    )));
                }
            }
        }
        Ok(result)
    }
}

impl From<RunResult> for serde_json::Value {
    fn from(result: RunResult) -> Self {
        serde_json::to_value(result).unwrap_or_else(|_| empty_object())
    }
}
