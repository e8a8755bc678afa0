//! Demo node: runs a task manager over the in-memory store.
//!
//! Schedules a recurring heartbeat and a one-off task that fails twice before
//! succeeding, then polls until `--run-for` elapses or Ctrl-C.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use taskmgr_core::impls::InMemoryDocumentStore;
use taskmgr_core::{
    FetchOpts, HandlerError, Interval, RunContext, ScheduleOptions, TaskDefinition, TaskHandler,
    TaskInstance, TaskManager, TaskManagerConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmgr")]
#[command(about = "Run a demo task manager node", long_about = None)]
struct Cli {
    /// JSON file with task manager settings (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds to keep polling before shutting down
    #[arg(long, default_value_t = 10)]
    run_for: u64,
}

/// Counts its own runs in the task state.
struct Heartbeat {
    context: RunContext,
}

#[async_trait]
impl TaskHandler for Heartbeat {
    async fn run(&self) -> Result<Option<Value>, HandlerError> {
        let beats = self.context.task_instance.state["beats"].as_u64().unwrap_or(0) + 1;
        info!(beats, "heartbeat");
        Ok(Some(json!({ "state": { "beats": beats } })))
    }
}

/// Fails until it has been attempted `succeed_after` times.
struct Flaky {
    context: RunContext,
    succeed_after: u32,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn run(&self) -> Result<Option<Value>, HandlerError> {
        let attempts = self.context.task_instance.attempts;
        if attempts < self.succeed_after {
            return Err(format!("simulated failure on attempt {}", attempts + 1).into());
        }
        info!(attempts, "flaky task finally succeeded");
        Ok(None)
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TaskManagerConfig> {
    let Some(path) = path else {
        return Ok(TaskManagerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

fn definitions() -> HashMap<String, TaskDefinition> {
    HashMap::from([
        (
            "demo.heartbeat".to_string(),
            TaskDefinition::new(|context: RunContext| {
                Arc::new(Heartbeat { context }) as Arc<dyn TaskHandler>
            })
            .title("Heartbeat")
            .timeout(Interval::seconds(30)),
        ),
        (
            "demo.flaky".to_string(),
            TaskDefinition::new(|context: RunContext| {
                Arc::new(Flaky {
                    context,
                    succeed_after: 2,
                }) as Arc<dyn TaskHandler>
            })
            .title("Flaky one-off")
            .description("Fails twice, then succeeds and is removed"),
        ),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let manager = TaskManager::new(config, Arc::new(InMemoryDocumentStore::new()))?
        // retry quickly so the demo shows the whole cycle
        .with_backoff(Arc::new(taskmgr_core::domain::LinearBackoff {
            step: chrono::TimeDelta::seconds(1),
        }));
    manager.register_task_definitions(definitions())?;
    manager.start().await?;

    manager
        .schedule(
            TaskInstance::new("demo.heartbeat")
                .with_id("heartbeat")
                .with_interval(Interval::seconds(2)),
            ScheduleOptions::default(),
        )
        .await?;
    manager
        .schedule(TaskInstance::new("demo.flaky"), ScheduleOptions::default())
        .await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.run_for)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let remaining = manager.fetch(FetchOpts::default()).await?;
    for task in &remaining.docs {
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            status = task.status.as_str(),
            attempts = task.attempts,
            state = %task.state,
            "remaining task"
        );
    }
    manager.stop().await;
    Ok(())
}
