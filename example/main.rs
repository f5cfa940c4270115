use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use taskcuter::*;
use tracing_subscriber::EnvFilter;

/// Runs a task file (or a built-in demo graph) through the task processor.
#[derive(Parser, Debug)]
#[command(name = "taskcuter")]
struct Args {
    /// Task file: .json, .yaml, .toml or .md
    file: Option<PathBuf>,

    /// Processor config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Re-run pending tasks until nothing changes
    #[arg(long)]
    drain: bool,
}

/// Returns its arguments, stamped.
struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        Ok(json!({
            "args": args,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

/// Sleeps for `ms` milliseconds.
struct Sleep;

#[async_trait]
impl Tool for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Always fails, without retries.
struct Fail;

#[async_trait]
impl Tool for Fail {
    fn name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool failed");
        Err(ToolError::fatal(message))
    }
}

/// Fails transiently the first `failures` calls, then succeeds.
struct Flaky {
    calls: AtomicU32,
}

#[async_trait]
impl Tool for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        let failures = args.get("failures").and_then(Value::as_u64).unwrap_or(1) as u32;
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            return Err(ToolError::transient(format!("attempt {} failed", call)));
        }
        Ok(json!({ "attempts": call }))
    }
}

fn demo_tasks() -> Vec<Task> {
    vec![
        Task::tool("task6", "echo", json!({"step": 6})).with_dependencies(["task1", "task4", "task5"]),
        Task::tool("task1", "sleep", json!({"ms": 100})),
        Task::tool("task2", "flaky", json!({"failures": 1})).with_dependencies(["task1"]),
        Task::tool("task3", "echo", json!({"step": 3})).with_dependencies(["task1"]),
        Task::tool("task4", "echo", json!({"step": 4})).with_dependencies(["task2", "task3"]),
        Task::tool("task5", "echo", json!({"step": 5})).with_dependencies(["task2"]),
        Task::batch(
            "cleanup",
            vec![
                Task::tool("purge-cache", "echo", json!({})),
                Task::tool("purge-tmp", "fail", json!({"message": "permission denied"})),
            ],
        ),
        Task::tool("report", "echo", json!({})).with_dependencies(["cleanup"]),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let tools = ToolRegistry::new()
        .with(Echo)
        .with(Sleep)
        .with(Fail)
        .with(Flaky {
            calls: AtomicU32::new(0),
        });
    println!("tools: {}", tools.names().join(", "));

    let builder = TaskProcessor::builder(Arc::new(tools));
    let processor = match &args.config {
        Some(path) => builder.config_file(path)?,
        None => {
            let config = ProcessorConfig {
                retry: RetryPolicy::fixed(Duration::from_millis(200)),
                ..Default::default()
            }
            .with_env_overrides()?;
            builder.config(&config)
        }
    }
    .build();

    match &args.file {
        Some(path) => {
            let task = processor.process_task_file(path).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        None => {
            for task in demo_tasks() {
                let task = processor.process_task(task).await?;
                println!("{:<12} {}", task.id.to_string(), task.status);
            }
        }
    }

    if args.drain || args.file.is_none() {
        let report = processor.drain_pending().await?;
        println!(
            "\ndrained in {} passes: {} completed, {} failed, {} cancelled, {} pending",
            report.passes,
            report.completed.len(),
            report.failed.len(),
            report.cancelled.len(),
            report.pending.len()
        );
    }

    println!("\n{}", processor.render_graph().await);

    let order: Vec<String> = processor
        .execution_order()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("execution order: {}", order.join(" -> "));

    Ok(())
}
