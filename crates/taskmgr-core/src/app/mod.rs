//! Application layer: wires the store, runners, pool and poller together.
//!
//! - **TaskRunner**: claim, run and record one task instance
//! - **TaskPool**: per-type and global concurrency limits
//! - **TaskPoller**: the timer driving poll cycles
//! - **MiddlewareChain**: `before_save` / `before_run` hooks
//! - **TaskManager**: lifecycle-gated facade

pub mod config;
pub mod manager;
pub mod middleware;
pub mod poller;
pub mod pool;
pub mod runner;

pub use self::config::TaskManagerConfig;
pub use self::manager::{Lifecycle, TaskManager};
pub use self::middleware::{Middleware, MiddlewareChain};
pub use self::poller::{PollFuture, PollWork, TaskPoller};
pub use self::pool::{FillPoolResult, PoolStats, TaskPool};
pub use self::runner::{RunOutcome, RunnerState, TaskRunner};
