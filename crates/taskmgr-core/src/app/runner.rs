//! TaskRunner - one claim-run-record cycle of a single task instance.
//!
//! State machine:
//! ```text
//! Constructed --claim_ownership--> Claimed --run--> Running --process_result--> Finished
//!             \--(lost race)-----> Unclaimed
//! ```
//!
//! # 設計
//! - store への書き込みは必ず直前に読んだ token を添えた条件付き書き込み
//! - lease を他ノードに取られた runner は新しい持ち主の結果を上書きできない

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::app::middleware::MiddlewareChain;
use crate::domain::{
    BackoffPolicy, ConcreteTaskInstance, Decision, Result, RunContext, RunResult, TaskDefinition,
    TaskHandler, TaskId, TaskManagerError, TaskStatus, decide,
};
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Persisted as idle with a new `runAt`.
    Rescheduled,
    /// Persisted as failed; retries exhausted.
    Failed,
    /// One-off task deleted.
    Removed,
    /// Another node wrote the instance first; our result was dropped.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Constructed,
    Claimed,
    Unclaimed,
    Running,
    Finished(RunOutcome),
}

impl RunnerState {
    fn as_str(self) -> &'static str {
        match self {
            RunnerState::Constructed => "constructed",
            RunnerState::Claimed => "claimed",
            RunnerState::Unclaimed => "unclaimed",
            RunnerState::Running => "running",
            RunnerState::Finished(_) => "finished",
        }
    }
}

pub struct TaskRunner {
    definition: Arc<TaskDefinition>,
    store: Arc<TaskStore>,
    middleware: Arc<MiddlewareChain>,
    backoff: Arc<dyn BackoffPolicy>,
    instance: Mutex<ConcreteTaskInstance>,
    handler: Mutex<Option<Arc<dyn TaskHandler>>>,
    state: Mutex<RunnerState>,
}

impl TaskRunner {
    pub fn new(
        instance: ConcreteTaskInstance,
        definition: Arc<TaskDefinition>,
        store: Arc<TaskStore>,
        middleware: Arc<MiddlewareChain>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            definition,
            store,
            middleware,
            backoff,
            instance: Mutex::new(instance),
            handler: Mutex::new(None),
            state: Mutex::new(RunnerState::Constructed),
        }
    }

    pub fn id(&self) -> TaskId {
        lock(&self.instance).id.clone()
    }

    pub fn task_type(&self) -> &str {
        self.definition.task_type()
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    /// Snapshot of the instance as last read or written by this runner.
    pub fn instance(&self) -> ConcreteTaskInstance {
        lock(&self.instance).clone()
    }

    pub fn state(&self) -> RunnerState {
        *lock(&self.state)
    }

    /// The lease (`runAt`) has passed.
    pub fn is_expired(&self) -> bool {
        lock(&self.instance).run_at < self.store.now()
    }

    /// Try to take the lease: `status = running`, `runAt = now + timeout`.
    ///
    /// `Ok(false)` means another node got there first.
    pub async fn claim_ownership(&self) -> Result<bool> {
        self.expect_state("claim", RunnerState::Constructed)?;

        // 重要: runAt を lease の期限に使う。期限切れの running は他ノードから再 claim される
        let now = self.store.now();
        let claim = ConcreteTaskInstance {
            status: TaskStatus::Running,
            run_at: self.definition.timeout.after(now),
            ..self.instance()
        };

        match self.store.update(&claim).await {
            Ok(claimed) => {
                debug!(task_id = %claimed.id, task_type = %claimed.task_type, lease_until = %claimed.run_at, "claimed task");
                *lock(&self.instance) = claimed;
                self.set_state(RunnerState::Claimed);
                Ok(true)
            }
            Err(err) if err.is_conflict() || err.is_not_found() => {
                debug!(task_id = %claim.id, task_type = %claim.task_type, error = %err, "lost claim race");
                self.set_state(RunnerState::Unclaimed);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Run the handler and record its result.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.expect_state("run", RunnerState::Claimed)?;

        let context = self
            .middleware
            .before_run(RunContext::new(self.instance()))
            .await?;
        let prior_state = context.task_instance.state.clone();

        let handler = self.definition.create_handler(context);
        *lock(&self.handler) = Some(Arc::clone(&handler));
        self.set_state(RunnerState::Running);

        let result = match handler.run().await {
            Ok(output) => RunResult::from_output(output).unwrap_or_else(|err| {
                warn!(task_id = %self.id(), task_type = self.task_type(), error = %err, "invalid run result; using an empty state");
                RunResult::default()
            }),
            Err(err) => {
                error!(task_id = %self.id(), task_type = self.task_type(), error = %err, "task run failed");
                RunResult::failed(err.to_string(), prior_state)
            }
        };

        self.process_result(result).await
    }

    /// Persist the outcome of a run: reschedule, park as failed, or delete.
    pub async fn process_result(&self, result: RunResult) -> Result<RunOutcome> {
        let instance = self.instance();
        let now = self.store.now();
        let max_attempts = self.store.options().max_attempts;

        let outcome = match decide(&instance, &result, now, max_attempts, self.backoff.as_ref()) {
            Decision::Reschedule {
                status,
                run_at,
                attempts,
                state,
            } => {
                let next = ConcreteTaskInstance {
                    status,
                    run_at,
                    attempts,
                    state,
                    ..instance
                };
                match self.store.update(&next).await {
                    Ok(updated) => {
                        let outcome = if updated.status == TaskStatus::Failed {
                            warn!(task_id = %updated.id, task_type = %updated.task_type, attempts = updated.attempts, "task exceeded max attempts; marked as failed");
                            RunOutcome::Failed
                        } else {
                            debug!(task_id = %updated.id, task_type = %updated.task_type, run_at = %updated.run_at, attempts = updated.attempts, "rescheduled task");
                            RunOutcome::Rescheduled
                        };
                        *lock(&self.instance) = updated;
                        outcome
                    }
                    Err(err) if err.is_conflict() => {
                        warn!(task_id = %next.id, task_type = %next.task_type, "task was updated by another node; dropping this result");
                        RunOutcome::LeaseLost
                    }
                    Err(err) => return Err(err),
                }
            }
            Decision::Remove => match self.store.remove_claimed(&instance).await {
                Ok(()) => {
                    debug!(task_id = %instance.id, task_type = %instance.task_type, "removed completed task");
                    RunOutcome::Removed
                }
                Err(err) if err.is_not_found() => {
                    warn!(task_id = %instance.id, task_type = %instance.task_type, "completed task was already removed");
                    RunOutcome::Removed
                }
                Err(err) if err.is_conflict() => {
                    debug!(task_id = %instance.id, task_type = %instance.task_type, "completed task was reclaimed elsewhere; leaving it");
                    RunOutcome::LeaseLost
                }
                Err(err) => return Err(err),
            },
        };

        self.set_state(RunnerState::Finished(outcome));
        Ok(outcome)
    }

    /// Ask the handler to stop. Best effort.
    pub async fn cancel(&self) {
        let handler = lock(&self.handler).clone();
        let Some(handler) = handler else {
            warn!(task_id = %self.id(), task_type = self.task_type(), "cannot cancel a task that has not started");
            return;
        };
        match handler.cancel().await {
            None => {
                warn!(task_id = %self.id(), task_type = self.task_type(), "task does not support cancellation")
            }
            Some(Ok(())) => info!(task_id = %self.id(), task_type = self.task_type(), "cancelled task"),
            Some(Err(err)) => {
                warn!(task_id = %self.id(), task_type = self.task_type(), error = %err, "task cancellation failed")
            }
        }
    }

    fn expect_state(&self, operation: &'static str, expected: RunnerState) -> Result<()> {
        let current = self.state();
        if current != expected {
            return Err(TaskManagerError::lifecycle(operation, current.as_str()));
        }
        Ok(())
    }

    fn set_state(&self, state: RunnerState) {
        *lock(&self.state) = state;
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("id", &self.id())
            .field("task_type", &self.task_type())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app::middleware::Middleware;
    use crate::domain::{
        ConcurrencyToken, HandlerError, Interval, LinearBackoff, TaskInstance,
        sanitize_task_definitions,
    };
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::store::TaskStoreOptions;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn concrete(task_type: &str) -> ConcreteTaskInstance {
        ConcreteTaskInstance {
            id: TaskId::new("t1"),
            token: ConcurrencyToken::new("1"),
            task_type: task_type.into(),
            params: json!({}),
            state: json!({}),
            scheduled_at: start(),
            run_at: start(),
            interval: None,
            attempts: 0,
            status: TaskStatus::Idle,
            user: None,
            scope: None,
        }
    }

    /// Returns a fixed output, or fails when `output` is `Err`.
    pub(crate) struct Scripted {
        pub(crate) output: std::result::Result<Option<Value>, String>,
        pub(crate) cancelled: Option<Arc<AtomicBool>>,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn run(&self) -> std::result::Result<Option<Value>, HandlerError> {
            self.output.clone().map_err(Into::into)
        }

        async fn cancel(&self) -> Option<std::result::Result<(), HandlerError>> {
            let flag = self.cancelled.as_ref()?;
            flag.store(true, Ordering::SeqCst);
            Some(Ok(()))
        }
    }

    pub(crate) fn scripted(
        output: std::result::Result<Option<Value>, String>,
    ) -> crate::domain::TaskDefinition {
        crate::domain::TaskDefinition::new(move |_ctx: RunContext| {
            Arc::new(Scripted {
                output: output.clone(),
                cancelled: None,
            }) as Arc<dyn TaskHandler>
        })
    }

    pub(crate) struct Harness {
        pub(crate) docs: InMemoryDocumentStore,
        pub(crate) clock: Arc<FixedClock>,
        pub(crate) store: Arc<TaskStore>,
    }

    pub(crate) fn harness(types: &[&str]) -> Harness {
        let docs = InMemoryDocumentStore::new();
        let clock = Arc::new(FixedClock::new(start()));
        let store = Arc::new(TaskStore::new(
            Arc::new(docs.clone()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            TaskStoreOptions::default(),
        ));
        store.add_supported_types(types.iter().copied()).unwrap();
        Harness { docs, clock, store }
    }

    impl Harness {
        pub(crate) fn runner(
            &self,
            instance: ConcreteTaskInstance,
            definition: crate::domain::TaskDefinition,
        ) -> TaskRunner {
            self.runner_with(instance, definition, MiddlewareChain::new())
        }

        pub(crate) fn runner_with(
            &self,
            instance: ConcreteTaskInstance,
            definition: crate::domain::TaskDefinition,
            middleware: MiddlewareChain,
        ) -> TaskRunner {
            let task_type = instance.task_type.clone();
            let mut sanitized = sanitize_task_definitions(
                HashMap::from([(task_type, definition)]),
                10,
                &HashMap::new(),
            )
            .unwrap();
            TaskRunner::new(
                instance,
                Arc::new(sanitized.remove(0)),
                Arc::clone(&self.store),
                Arc::new(middleware),
                Arc::new(LinearBackoff::default()),
            )
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let a = h.runner(task.clone(), scripted(Ok(None)));
        let b = h.runner(task.clone(), scripted(Ok(None)));

        let (won_a, won_b) = tokio::join!(a.claim_ownership(), b.claim_ownership());
        let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
        assert!(won_a ^ won_b);

        let winner = if won_a { &a } else { &b };
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.token, winner.instance().token);
        assert_eq!(stored.run_at, start() + TimeDelta::minutes(5));

        let loser = if won_a { &b } else { &a };
        assert_eq!(loser.state(), RunnerState::Unclaimed);
    }

    #[tokio::test]
    async fn run_requires_a_claim() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let runner = h.runner(task, scripted(Ok(None)));

        let err = runner.run().await.unwrap_err();
        assert!(matches!(
            err,
            TaskManagerError::Lifecycle {
                operation: "run",
                phase: "constructed"
            }
        ));
    }

    #[tokio::test]
    async fn one_off_success_is_removed() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let runner = h.runner(task.clone(), scripted(Ok(Some(json!({ "state": { "count": 5 } })))));

        assert!(runner.claim_ownership().await.unwrap());
        assert_eq!(runner.run().await.unwrap(), RunOutcome::Removed);

        assert!(h.store.get(&task.id).await.unwrap().is_none());
        assert_eq!(runner.state(), RunnerState::Finished(RunOutcome::Removed));
    }

    #[tokio::test]
    async fn interval_success_is_rescheduled() {
        let h = harness(&["report"]);
        let task = h
            .store
            .schedule(
                TaskInstance::new("report")
                    .with_interval(Interval::minutes(1))
                    .with_run_at(start()),
            )
            .await
            .unwrap();
        let runner = h.runner(task.clone(), scripted(Ok(Some(json!({ "state": { "count": 5 } })))));
        assert!(runner.claim_ownership().await.unwrap());

        h.clock.advance(TimeDelta::seconds(10));
        assert_eq!(runner.run().await.unwrap(), RunOutcome::Rescheduled);

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Idle);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.state, json!({ "count": 5 }));
        assert_eq!(stored.run_at, start() + TimeDelta::seconds(70));
    }

    #[tokio::test]
    async fn failure_counts_an_attempt_and_backs_off() {
        let h = harness(&["report"]);
        let task = h
            .store
            .schedule(TaskInstance::new("report").with_state(json!({ "cursor": 7 })))
            .await
            .unwrap();
        let runner = h.runner(task.clone(), scripted(Err("boom".into())));
        assert!(runner.claim_ownership().await.unwrap());

        assert_eq!(runner.run().await.unwrap(), RunOutcome::Rescheduled);

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, TaskStatus::Idle);
        assert_eq!(stored.run_at, start() + TimeDelta::minutes(5));
        assert_eq!(stored.state, json!({ "cursor": 7 }));
    }

    #[tokio::test]
    async fn invalid_result_falls_back_to_empty_state() {
        let h = harness(&["report"]);
        let task = h
            .store
            .schedule(
                TaskInstance::new("report")
                    .with_interval(Interval::minutes(1))
                    .with_run_at(start())
                    .with_state(json!({ "old": true })),
            )
            .await
            .unwrap();
        let runner = h.runner(task.clone(), scripted(Ok(Some(json!("done")))));
        assert!(runner.claim_ownership().await.unwrap());

        assert_eq!(runner.run().await.unwrap(), RunOutcome::Rescheduled);

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, json!({}));
    }

    #[tokio::test]
    async fn result_after_lost_lease_is_dropped() {
        let h = harness(&["report"]);
        let task = h
            .store
            .schedule(
                TaskInstance::new("report")
                    .with_interval(Interval::minutes(1))
                    .with_run_at(start()),
            )
            .await
            .unwrap();
        let runner = h.runner(task.clone(), scripted(Ok(None)));
        assert!(runner.claim_ownership().await.unwrap());

        // another node reclaims after the lease expired
        let reclaimed = h
            .store
            .update(&ConcreteTaskInstance {
                state: json!({ "owner": "other" }),
                ..runner.instance()
            })
            .await
            .unwrap();

        assert_eq!(runner.run().await.unwrap(), RunOutcome::LeaseLost);
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.token, reclaimed.token);
        assert_eq!(stored.state, json!({ "owner": "other" }));
    }

    struct StampRun;

    #[async_trait]
    impl Middleware for StampRun {
        async fn before_run(
            &self,
            mut context: RunContext,
        ) -> std::result::Result<RunContext, HandlerError> {
            context.task_instance.state = json!({ "stamped": true });
            Ok(context)
        }
    }

    #[tokio::test]
    async fn handler_error_keeps_the_state_produced_by_before_run() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(StampRun));
        let runner = h.runner_with(task.clone(), scripted(Err("boom".into())), chain);
        assert!(runner.claim_ownership().await.unwrap());

        runner.run().await.unwrap();

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, json!({ "stamped": true }));
    }

    #[tokio::test]
    async fn cancel_reaches_the_handler() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&flag);
        let definition = crate::domain::TaskDefinition::new(move |_ctx: RunContext| {
            Arc::new(Scripted {
                output: Ok(None),
                cancelled: Some(Arc::clone(&handler_flag)),
            }) as Arc<dyn TaskHandler>
        });
        let runner = h.runner(task, definition);

        // not started yet: only a warning
        runner.cancel().await;
        assert!(!flag.load(Ordering::SeqCst));

        assert!(runner.claim_ownership().await.unwrap());
        runner.run().await.unwrap();
        runner.cancel().await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lease_expiry_follows_the_clock() {
        let h = harness(&["report"]);
        let task = h.store.schedule(TaskInstance::new("report")).await.unwrap();
        let runner = h.runner(task, scripted(Ok(None)));
        assert!(runner.claim_ownership().await.unwrap());

        assert!(!runner.is_expired());
        h.clock.advance(TimeDelta::minutes(6));
        assert!(runner.is_expired());
        assert!(!h.docs.is_empty().await);
    }
}
