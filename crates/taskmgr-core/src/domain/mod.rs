//! Domain model (ids, instances, definitions, results, decisions, errors).
//!
//! Everything here is plain data or pure functions; I/O lives behind the
//! traits in `ports`.

pub mod context;
pub mod decision;
pub mod definition;
pub mod document;
pub mod errors;
pub mod ids;
pub mod interval;
pub mod run_result;
pub mod task;
pub mod token;

pub use self::context::{RunContext, ScheduleContext, ScheduleOptions};
pub use self::decision::{BackoffPolicy, Decision, LinearBackoff, decide};
pub use self::definition::{
    TaskDefinition, TaskDefinitions, TaskHandler, TaskHandlerFactory, sanitize_task_definitions,
};
pub use self::document::{DocumentMetadata, TASK_DOCUMENT_TYPE, TaskDocument, TaskFields};
pub use self::errors::{HandlerError, Result, TaskManagerError};
pub use self::ids::TaskId;
pub use self::interval::{Interval, IntervalUnit};
pub use self::run_result::RunResult;
pub use self::task::{ConcreteTaskInstance, TaskInstance, TaskStatus};
pub use self::token::ConcurrencyToken;
