//! Enhancement hooks around tool execution.
//!
//! Hooks fetch recommendations before a task runs and record an embedding of
//! the finished task afterwards. Nothing in here can change a task's status:
//! every call is wrapped so failures come back as a `Result` the processor
//! only logs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::{Task, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("enhancement hook failed: {0}")]
    Hook(String),
    #[error("no fallback store configured")]
    NoFallbackStore,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// What the pre-execution hook gets to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            kind: task.kind.name().to_string(),
        }
    }
}

/// What the post-execution hook gets to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskContext {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub metadata: Map<String, Value>,
}

impl From<&Task> for TaskContext {
    fn from(task: &Task) -> Self {
        Self {
            summary: TaskSummary::from(task),
            metadata: task.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Recommendations {
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[async_trait]
pub trait EnhancementHook: Send + Sync {
    async fn pre_execute(&self, _task: &TaskSummary) -> Result<Recommendations, HookError> {
        Ok(Recommendations::default())
    }

    async fn post_execute(
        &self,
        _task: &TaskContext,
        _outcome: &ExecutionOutcome,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hook that does nothing; the processor's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl EnhancementHook for NoopHook {}

/// Minimal record of a finished task, written when the hook itself fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(task: &Task, outcome: &ExecutionOutcome) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind.name().to_string(),
            description: task.description.clone(),
            status: task.status,
            success: outcome.success,
            error: outcome.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FallbackStore: Send + Sync {
    async fn persist(&self, record: &EmbeddingRecord) -> Result<(), HookError>;
}

/// Appends one JSON object per line to a local file.
#[derive(Debug, Clone)]
pub struct JsonlFallbackStore {
    path: PathBuf,
}

impl JsonlFallbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FallbackStore for JsonlFallbackStore {
    async fn persist(&self, record: &EmbeddingRecord) -> Result<(), HookError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

pub async fn try_pre_execute(
    hook: &dyn EnhancementHook,
    task: &Task,
) -> Result<Recommendations, HookError> {
    hook.pre_execute(&TaskSummary::from(task)).await
}

/// First step of the post-execution pipeline.
pub async fn try_enhancement_hook(
    hook: &dyn EnhancementHook,
    task: &Task,
    outcome: &ExecutionOutcome,
) -> Result<(), HookError> {
    hook.post_execute(&TaskContext::from(task), outcome).await
}

/// Second step, only taken when [`try_enhancement_hook`] failed.
pub async fn try_fallback_persistence(
    store: Option<&dyn FallbackStore>,
    task: &Task,
    outcome: &ExecutionOutcome,
) -> Result<(), HookError> {
    let store = store.ok_or(HookError::NoFallbackStore)?;
    store.persist(&EmbeddingRecord::new(task, outcome)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished() -> Task {
        let mut task = Task::tool("t1", "transcribe", json!({"file": "a.mp3"}))
            .with_description("transcribe episode")
            .with_metadata("source", json!("podcast"));
        task.status = TaskStatus::Completed;
        task
    }

    #[test]
    fn context_flattens_summary() {
        let ctx = TaskContext::from(&finished());
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["id"], json!("t1"));
        assert_eq!(value["type"], json!("tool"));
        assert_eq!(value["description"], json!("transcribe episode"));
        assert_eq!(value["metadata"]["source"], json!("podcast"));
    }

    #[tokio::test]
    async fn noop_hook_succeeds() {
        let task = finished();
        let recs = try_pre_execute(&NoopHook, &task).await.unwrap();
        assert!(recs.recommendations.is_empty());
        try_enhancement_hook(&NoopHook, &task, &ExecutionOutcome::success(json!(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fallback_without_store_is_an_error() {
        let err = try_fallback_persistence(None, &finished(), &ExecutionOutcome::failure("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::NoFallbackStore));
    }

    #[tokio::test]
    async fn jsonl_store_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlFallbackStore::new(dir.path().join("nested").join("embeddings.jsonl"));
        let task = finished();

        try_fallback_persistence(Some(&store), &task, &ExecutionOutcome::success(json!(1)))
            .await
            .unwrap();
        try_fallback_persistence(Some(&store), &task, &ExecutionOutcome::failure("boom"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(store.path()).await.unwrap();
        let records: Vec<EmbeddingRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[1].error.as_deref(), Some("boom"));
        assert_eq!(records[1].kind, "tool");
    }
}
