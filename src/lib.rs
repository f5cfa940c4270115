pub mod task;
pub mod cycle_check;
pub mod graph;
pub mod dependency;
pub mod retry;
pub mod invoker;
pub mod hooks;
pub mod config;
pub mod processor;
pub mod ingest;

pub use task::{
    BatchSource, DEFAULT_MAX_RETRIES, GeneratorHandle, Task, TaskDocument, TaskId, TaskKind,
    TaskStatus, TransitionError,
};
pub use cycle_check::find_cycle;
pub use graph::{InMemoryTaskGraph, TaskRepository};
pub use dependency::{DependencyChecker, Readiness};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryQueue};
pub use invoker::{Tool, ToolError, ToolInvoker, ToolRegistry};
pub use hooks::{
    EmbeddingRecord, EnhancementHook, ExecutionOutcome, FallbackStore, HookError,
    JsonlFallbackStore, NoopHook, Recommendations, TaskContext, TaskSummary,
};
pub use config::{ConfigError, ProcessorConfig};
pub use processor::{BatchError, BatchOutcome, DrainReport, TaskProcessor, TaskProcessorBuilder};
pub use ingest::{DocumentFormat, load_task_file, parse_task_document};

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Shared, in-place mutable task. Every holder observes the processor's writes.
pub type TaskHandle = Arc<RwLock<Task>>;
pub type BoxTool = Arc<dyn Tool>;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Invalid task: {0}")]
    Validation(String),
    #[error("Dynamic batch {0} is not supported here; its sub-tasks must be materialized by the orchestrator")]
    DynamicBatchUnsupported(TaskId),
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse task document: {0}")]
    Parse(String),
    #[error("Failed to serialize outcome of batch {id}: {source}")]
    Serialize {
        id: TaskId,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
