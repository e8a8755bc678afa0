//! taskmgr-core
//!
//! A distributed task scheduler for stateless nodes sharing one document
//! store. Nodes poll for due tasks, claim them with a conditional write
//! (the only mutual exclusion used), run them, and record the result.
//!
//! # Modules
//! - **domain**: task instances, definitions, run results, the result decision, errors
//! - **ports**: `DocumentStore`, `Clock`, `IdGenerator` and typed queries
//! - **store**: `TaskStore`, the repository over a `DocumentStore`
//! - **app**: runner, pool, poller, middleware and the `TaskManager` facade
//! - **impls**: `InMemoryDocumentStore`

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod store;

pub use app::{Middleware, TaskManager, TaskManagerConfig};
pub use domain::{
    ConcreteTaskInstance, HandlerError, Interval, RunContext, RunResult, ScheduleContext,
    ScheduleOptions, TaskDefinition, TaskHandler, TaskId, TaskInstance, TaskManagerError,
    TaskStatus,
};
pub use store::{FetchOpts, FetchResult, RemoveOutcome, RemoveResult, TaskStore};
