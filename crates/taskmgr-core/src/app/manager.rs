//! TaskManager - the facade embedders talk to.
//!
//! Lifecycle:
//! ```text
//! Configuring --start()--> Starting --(poller up)--> Operating --stop()--> Stopped
//! ```
//! - definition / middleware の追加は Configuring の間だけ
//! - schedule / fetch / remove は Operating の間だけ
//! - Stopped は終端 (再 start 不可)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::app::config::TaskManagerConfig;
use crate::app::middleware::{Middleware, MiddlewareChain};
use crate::app::poller::{PollFuture, PollWork, TaskPoller};
use crate::app::pool::{PoolStats, TaskPool};
use crate::app::runner::TaskRunner;
use crate::domain::{
    BackoffPolicy, ConcreteTaskInstance, LinearBackoff, Result, ScheduleContext, ScheduleOptions,
    TaskDefinition, TaskDefinitions, TaskId, TaskInstance, TaskManagerError,
    sanitize_task_definitions,
};
use crate::ports::{Clock, DocumentStore, SystemClock, UlidGenerator};
use crate::store::{FetchOpts, FetchResult, RemoveResult, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Configuring,
    Starting,
    Operating,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Configuring => "configuring",
            Lifecycle::Starting => "starting",
            Lifecycle::Operating => "operating",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// Everything a poll cycle needs to turn fetched instances into runners.
struct RunnerFactory {
    definitions: Arc<TaskDefinitions>,
    store: Arc<TaskStore>,
    middleware: Arc<MiddlewareChain>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl RunnerFactory {
    fn runner_for(&self, instance: ConcreteTaskInstance) -> Option<TaskRunner> {
        let Some(definition) = self.definitions.get(&instance.task_type) else {
            warn!(task_id = %instance.id, task_type = %instance.task_type, "no definition for task type; skipping");
            return None;
        };
        Some(TaskRunner::new(
            instance,
            Arc::clone(definition),
            Arc::clone(&self.store),
            Arc::clone(&self.middleware),
            Arc::clone(&self.backoff),
        ))
    }
}

struct Inner {
    lifecycle: Lifecycle,
    definitions: TaskDefinitions,
    middleware: MiddlewareChain,
    /// Frozen copy of `middleware`, taken on start.
    running_middleware: Arc<MiddlewareChain>,
    poller: Option<Arc<TaskPoller>>,
    pool: Option<Arc<TaskPool>>,
}

pub struct TaskManager {
    config: TaskManagerConfig,
    store: Arc<TaskStore>,
    backoff: Arc<dyn BackoffPolicy>,
    inner: Mutex<Inner>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, documents: Arc<dyn DocumentStore>) -> Result<Self> {
        Self::with_clock(config, documents, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: TaskManagerConfig,
        documents: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store = TaskStore::new(
            documents,
            Arc::clone(&clock),
            Arc::new(UlidGenerator::new(clock)),
            config.store_options(),
        );
        Ok(Self {
            config,
            store: Arc::new(store),
            backoff: Arc::new(LinearBackoff::default()),
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Configuring,
                definitions: TaskDefinitions::new(),
                middleware: MiddlewareChain::new(),
                running_middleware: Arc::new(MiddlewareChain::new()),
                poller: None,
                pool: None,
            }),
        })
    }

    /// Replace the retry delay used for failed tasks without an interval.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner().lifecycle
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Register a batch of definitions keyed by task type.
    ///
    /// All-or-nothing: if any type is already registered the batch is
    /// rejected and existing definitions are untouched.
    pub fn register_task_definitions(
        &self,
        definitions: HashMap<String, TaskDefinition>,
    ) -> Result<()> {
        let mut inner = self.inner();
        require(&inner, "register task definitions", Lifecycle::Configuring)?;
        let sanitized = sanitize_task_definitions(
            definitions,
            self.config.max_workers,
            &self.config.override_num_workers,
        )?;
        let types: Vec<String> = sanitized.iter().map(|d| d.task_type().to_string()).collect();
        inner.definitions.register_all(sanitized)?;
        info!(task_types = ?types, "registered task definitions");
        Ok(())
    }

    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        let mut inner = self.inner();
        require(&inner, "add middleware", Lifecycle::Configuring)?;
        inner.middleware.push(middleware);
        Ok(())
    }

    /// Start polling. Retries the store bootstrap until it succeeds.
    pub async fn start(&self) -> Result<()> {
        let (definitions, middleware) = {
            let mut inner = self.inner();
            require(&inner, "start", Lifecycle::Configuring)?;
            inner.lifecycle = Lifecycle::Starting;
            inner.running_middleware = Arc::new(inner.middleware.clone());
            (
                Arc::new(inner.definitions.clone()),
                Arc::clone(&inner.running_middleware),
            )
        };
        info!("task manager starting");

        if let Err(err) = self.store.add_supported_types(definitions.task_types()) {
            self.inner().lifecycle = Lifecycle::Configuring;
            return Err(err);
        }

        let pool = Arc::new(TaskPool::new(self.config.max_workers));
        let factory = Arc::new(RunnerFactory {
            definitions,
            store: Arc::clone(&self.store),
            middleware,
            backoff: Arc::clone(&self.backoff),
        });
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&self.store),
            self.config.poll_interval(),
            poll_work(Arc::clone(&pool), factory),
        ));

        while let Err(err) = poller.start().await {
            // 重要: retry 中に stop() されていたら Starting ではなくなっている
            require(&self.inner(), "start", Lifecycle::Starting)?;
            warn!(error = %err, retry_in_ms = self.config.poll_interval_ms, "could not start task poller; retrying");
            tokio::time::sleep(self.config.poll_interval()).await;
        }

        let abandoned = {
            let mut inner = self.inner();
            match require(&inner, "start", Lifecycle::Starting) {
                Ok(()) => {
                    inner.poller = Some(Arc::clone(&poller));
                    inner.pool = Some(pool);
                    inner.lifecycle = Lifecycle::Operating;
                    None
                }
                Err(err) => Some(err),
            }
        };
        if let Some(err) = abandoned {
            poller.stop().await;
            return Err(err);
        }
        info!("task manager operating");
        Ok(())
    }

    /// Run the `before_save` chain, persist the instance and wake the poller.
    pub async fn schedule(
        &self,
        instance: TaskInstance,
        options: ScheduleOptions,
    ) -> Result<ConcreteTaskInstance> {
        let (middleware, poller) = self.operating("schedule")?;
        let context = middleware
            .before_save(ScheduleContext::new(instance, options))
            .await?;
        let scheduled = self.store.schedule(context.task_instance).await?;
        if let Some(poller) = poller {
            poller.attempt_work();
        }
        Ok(scheduled)
    }

    pub async fn fetch(&self, opts: FetchOpts) -> Result<FetchResult> {
        self.operating("fetch")?;
        self.store.fetch(opts).await
    }

    pub async fn remove(&self, id: &TaskId) -> Result<RemoveResult> {
        self.operating("remove")?;
        self.store.remove(id).await
    }

    /// Stop polling and wait for in-flight runs.
    pub async fn stop(&self) {
        let (poller, pool) = {
            let mut inner = self.inner();
            if inner.lifecycle == Lifecycle::Stopped {
                return;
            }
            inner.lifecycle = Lifecycle::Stopped;
            (inner.poller.take(), inner.pool.clone())
        };
        if let Some(poller) = poller {
            poller.stop().await;
        }
        if let Some(pool) = pool {
            pool.drain().await;
        }
        info!("task manager stopped");
    }

    /// `None` until started.
    pub fn stats(&self) -> Option<PoolStats> {
        self.inner().pool.as_ref().map(|pool| pool.stats())
    }

    fn operating(
        &self,
        operation: &'static str,
    ) -> Result<(Arc<MiddlewareChain>, Option<Arc<TaskPoller>>)> {
        let inner = self.inner();
        require(&inner, operation, Lifecycle::Operating)?;
        Ok((Arc::clone(&inner.running_middleware), inner.poller.clone()))
    }

    // 重要: guard を await 越しに保持しない
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn require(inner: &Inner, operation: &'static str, expected: Lifecycle) -> Result<()> {
    if inner.lifecycle != expected {
        return Err(TaskManagerError::lifecycle(operation, inner.lifecycle.as_str()));
    }
    Ok(())
}

/// One poll cycle: fill the pool from the available-task query.
fn poll_work(pool: Arc<TaskPool>, factory: Arc<RunnerFactory>) -> PollWork {
    Arc::new(move || -> PollFuture {
        let pool = Arc::clone(&pool);
        let factory = Arc::clone(&factory);
        Box::pin(async move {
            let store = &factory.store;
            pool.fill_pool(
                || store.fetch_available_tasks(),
                |instance| factory.runner_for(instance),
            )
            .await?;
            Ok(())
        })
    })
}
