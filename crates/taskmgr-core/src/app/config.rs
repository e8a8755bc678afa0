//! Task manager configuration.
//!
//! Loading (files, env, settings services) is the embedder's concern; this
//! type only fixes the shape, the defaults and the sanity checks.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, TaskManagerError};
use crate::store::{API_VERSION, SCHEMA_VERSION, TaskStoreOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskManagerConfig {
    /// Index (collection) holding task documents.
    pub index: String,
    /// Global cap on concurrent runs in this process.
    pub max_workers: usize,
    /// Failures after which a task is parked as `failed`.
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Instances fetched per availability query.
    pub fetch_batch_size: usize,
    /// Per-type replacement for a definition's `num_workers`.
    pub override_num_workers: HashMap<String, usize>,
    pub api_version: u32,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            index: ".task_manager".to_string(),
            max_workers: 10,
            max_attempts: 3,
            poll_interval_ms: 3000,
            fetch_batch_size: 10,
            override_num_workers: HashMap::new(),
            api_version: API_VERSION,
        }
    }
}

impl TaskManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TaskManagerError::Config(msg));
        if self.index.trim().is_empty() {
            return invalid("index must not be empty".to_string());
        }
        for (name, value) in [
            ("max_workers", self.max_workers as u64),
            ("max_attempts", u64::from(self.max_attempts)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("fetch_batch_size", self.fetch_batch_size as u64),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if let Some((task_type, _)) = self.override_num_workers.iter().find(|(_, n)| **n == 0) {
            return invalid(format!(
                "override_num_workers.{task_type} must be greater than zero"
            ));
        }
        Ok(())
    }

    pub fn store_options(&self) -> TaskStoreOptions {
        TaskStoreOptions {
            index: self.index.clone(),
            max_attempts: self.max_attempts,
            api_version: self.api_version,
            schema_version: SCHEMA_VERSION,
            fetch_batch_size: self.fetch_batch_size,
        }
    }
}
