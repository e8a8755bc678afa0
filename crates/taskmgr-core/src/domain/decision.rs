//! Decision model: what happens to a task after one run.
//!
//! `decide` is a pure function (current instance + run result + now ->
//! next action). The runner executes the decision against the store.

use chrono::{DateTime, TimeDelta, Utc};

use super::run_result::RunResult;
use super::task::{ConcreteTaskInstance, TaskStatus};

/// Next run for a failed task that has no interval of its own.
pub trait BackoffPolicy: Send + Sync {
    /// `attempts` is the count before the failure being handled.
    fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc>;
}

/// `now + step * (attempts + 1)`: 5, 10, 15 minutes with the default step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub step: TimeDelta,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            step: TimeDelta::minutes(5),
        }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = self
            .step
            .checked_mul(attempts.saturating_add(1).min(i32::MAX as u32) as i32)
            .unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Persist the instance with new scheduling fields.
    Reschedule {
        status: TaskStatus,
        run_at: DateTime<Utc>,
        attempts: u32,
        state: serde_json::Value,
    },

    /// One-off task finished; delete it.
    Remove,
}

/// Decide the fate of `instance` after a run that produced `result`.
///
/// A run is treated as recurring when the task has an interval, the handler
/// asked for an explicit `runAt`, or the run failed. Failures count toward
/// `max_attempts`; once reached the task is parked as `Failed` with its
/// `run_at` left where it was.
pub fn decide(
    instance: &ConcreteTaskInstance,
    result: &RunResult,
    now: DateTime<Utc>,
    max_attempts: u32,
    backoff: &dyn BackoffPolicy,
) -> Decision {
    let recurring = instance.interval.is_some() || result.run_at.is_some() || result.is_error();
    if !recurring {
        return Decision::Remove;
    }

    let attempts = if result.is_error() {
        instance.attempts.saturating_add(1)
    } else {
        0
    };
    let status = if result.is_error() && attempts >= max_attempts {
        TaskStatus::Failed
    } else {
        TaskStatus::Idle
    };
    let run_at = match status {
        TaskStatus::Failed => instance.run_at,
        _ => result
            .run_at
            .or_else(|| instance.interval.map(|interval| interval.after(now)))
            .unwrap_or_else(|| backoff.next_run_at(now, instance.attempts)),
    };
    let state = result
        .state
        .clone()
        .unwrap_or_else(|| instance.state.clone());

    Decision::Reschedule {
        status,
        run_at,
        attempts,
        state,
    }
}
