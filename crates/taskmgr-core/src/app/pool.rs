//! TaskPool - bounded, process-local execution of claimed runners.
//!
//! # 設計
//! - 容量は 2 段: task type ごと (`num_workers`) と全体 (`max_workers`)
//! - slot は claim の前に確保し、spawn した run の終了時に解放する
//! - 遅い handler が `run` の呼び出し側をブロックすることはない

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::app::runner::{RunnerState, TaskRunner};
use crate::domain::{ConcreteTaskInstance, Result, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPoolResult {
    RanAllTasks,
    RanOutOfCapacity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub running: usize,
    pub max_workers: usize,
    pub running_by_type: BTreeMap<String, usize>,
}

#[derive(Default)]
struct PoolState {
    running: HashMap<TaskId, Arc<TaskRunner>>,
    by_type: HashMap<String, usize>,
}

enum Reservation {
    Reserved,
    TypeFull,
    PoolFull,
    AlreadyRunning,
}

pub struct TaskPool {
    max_workers: usize,
    state: Mutex<PoolState>,
    in_flight: Mutex<JoinSet<()>>,
}

impl TaskPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            state: Mutex::new(PoolState::default()),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            running: state.running.len(),
            max_workers: self.max_workers,
            running_by_type: state
                .by_type
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(t, n)| (t.clone(), *n))
                .collect(),
        }
    }

    /// Claim and start as many `runners` as capacity allows.
    ///
    /// Returns `RanOutOfCapacity` if any runner was skipped for lack of a
    /// slot; those instances stay available for the next cycle.
    pub async fn run(self: &Arc<Self>, runners: Vec<TaskRunner>) -> Result<FillPoolResult> {
        self.cancel_expired_tasks().await;
        self.reap_finished();

        let mut result = FillPoolResult::RanAllTasks;
        for runner in runners {
            let runner = Arc::new(runner);
            match self.try_reserve(&runner) {
                Reservation::Reserved => {}
                Reservation::PoolFull => return Ok(FillPoolResult::RanOutOfCapacity),
                Reservation::TypeFull | Reservation::AlreadyRunning => {
                    result = FillPoolResult::RanOutOfCapacity;
                    continue;
                }
            }

            match runner.claim_ownership().await {
                Ok(true) => self.spawn_run(runner),
                Ok(false) => self.release(&runner),
                Err(err) => {
                    self.release(&runner);
                    return Err(err);
                }
            }
        }
        Ok(result)
    }

    /// Fetch and run batches until nothing is available or the pool is full.
    pub async fn fill_pool<F, Fut, C>(
        self: &Arc<Self>,
        fetch: F,
        converter: C,
    ) -> Result<FillPoolResult>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Vec<ConcreteTaskInstance>>>,
        C: Fn(ConcreteTaskInstance) -> Option<TaskRunner>,
    {
        loop {
            let instances = fetch().await?;
            let runners: Vec<TaskRunner> = instances.into_iter().filter_map(&converter).collect();
            if runners.is_empty() {
                return Ok(FillPoolResult::RanAllTasks);
            }
            if self.run(runners).await? == FillPoolResult::RanOutOfCapacity {
                return Ok(FillPoolResult::RanOutOfCapacity);
            }
        }
    }

    /// Ask every run whose lease has passed to cancel itself.
    pub async fn cancel_expired_tasks(&self) {
        let expired: Vec<Arc<TaskRunner>> = lock(&self.state)
            .running
            .values()
            .filter(|runner| runner.state() == RunnerState::Running && runner.is_expired())
            .cloned()
            .collect();
        for runner in expired {
            warn!(task_id = %runner.id(), task_type = runner.task_type(), "task lease expired; cancelling");
            runner.cancel().await;
        }
    }

    /// Wait for every in-flight run to finish.
    pub async fn drain(&self) {
        loop {
            let mut in_flight = std::mem::take(&mut *lock(&self.in_flight));
            if in_flight.is_empty() {
                return;
            }
            while let Some(joined) = in_flight.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "task run aborted");
                }
            }
        }
    }

    fn try_reserve(&self, runner: &Arc<TaskRunner>) -> Reservation {
        let mut state = lock(&self.state);
        let id = runner.id();
        if state.running.contains_key(&id) {
            return Reservation::AlreadyRunning;
        }
        if state.running.len() >= self.max_workers {
            return Reservation::PoolFull;
        }
        let in_use = state.by_type.get(runner.task_type()).copied().unwrap_or(0);
        if in_use >= runner.definition().num_workers {
            return Reservation::TypeFull;
        }
        *state.by_type.entry(runner.task_type().to_string()).or_default() += 1;
        state.running.insert(id, Arc::clone(runner));
        Reservation::Reserved
    }

    fn spawn_run(self: &Arc<Self>, runner: Arc<TaskRunner>) {
        let pool = Arc::clone(self);
        // 重要: 成否に関わらず必ず release する
        lock(&self.in_flight).spawn(async move {
            match runner.run().await {
                Ok(outcome) => {
                    debug!(task_id = %runner.id(), task_type = runner.task_type(), ?outcome, "task run finished")
                }
                Err(err) => {
                    error!(task_id = %runner.id(), task_type = runner.task_type(), error = %err, "task run could not be recorded")
                }
            }
            pool.release(&runner);
        });
    }

    fn release(&self, runner: &TaskRunner) {
        let mut state = lock(&self.state);
        state.running.remove(&runner.id());
        if let Some(n) = state.by_type.get_mut(runner.task_type()) {
            *n = n.saturating_sub(1);
        }
    }

    /// Drop the outputs of runs that already completed.
    fn reap_finished(&self) {
        let mut in_flight = lock(&self.in_flight);
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(err) = joined {
                error!(error = %err, "task run aborted");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
