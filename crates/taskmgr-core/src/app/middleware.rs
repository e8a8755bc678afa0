//! Middleware chain around scheduling and running.
//!
//! Stages run in registration order, each receiving the context produced by
//! the previous one. The first error aborts the operation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{HandlerError, Result, RunContext, ScheduleContext, TaskManagerError};

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs before a new instance is written.
    async fn before_save(&self, context: ScheduleContext) -> Result<ScheduleContext, HandlerError> {
        Ok(context)
    }

    /// Runs after a claim, before the handler is created.
    async fn before_run(&self, context: RunContext) -> Result<RunContext, HandlerError> {
        Ok(context)
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.stages.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn before_save(&self, mut context: ScheduleContext) -> Result<ScheduleContext> {
        for stage in &self.stages {
            context = stage
                .before_save(context)
                .await
                .map_err(|err| TaskManagerError::Middleware(err.to_string()))?;
        }
        Ok(context)
    }

    pub async fn before_run(&self, mut context: RunContext) -> Result<RunContext> {
        for stage in &self.stages {
            context = stage
                .before_run(context)
                .await
                .map_err(|err| TaskManagerError::Middleware(err.to_string()))?;
        }
        Ok(context)
    }
}
