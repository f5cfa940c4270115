use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ProcessorError;

/// Retry ceiling used when a task carries no `max_retries` metadata.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const RETRY_COUNT_KEY: &str = "retry_count";
const MAX_RETRIES_KEY: &str = "max_retries";

/// Task identifier. Task files may use either numbers or strings, so both are
/// kept as distinct values: `1` and `"1"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Num(i64),
    Str(String),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Num(n) => write!(f, "{}", n),
            TaskId::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::Str(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId::Str(value)
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        TaskId::Num(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
    Blocked,
    Retrying,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Whether the processor may move a task from `self` to `to`.
    ///
    /// Terminal states never transition. `Running -> Pending` is only taken by
    /// a batch whose sub-tasks are still waiting on dependencies.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus as S;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, to),
            (
                S::Pending,
                S::Pending | S::Running | S::Blocked | S::Cancelled | S::Skipped | S::Error
            ) | (S::Blocked, S::Pending | S::Running | S::Cancelled)
                | (
                    S::Running,
                    S::Completed | S::Error | S::Retrying | S::Cancelled | S::Pending
                )
                | (S::Retrying, S::Pending | S::Error | S::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task {id}: invalid transition from {from} to {to}")]
    Invalid {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {id}: cannot complete without a result")]
    MissingResult { id: TaskId },
}

/// Opaque producer of sub-tasks. Its contents are never interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorHandle(pub Value);

#[derive(Debug, Clone, PartialEq)]
pub enum BatchSource {
    Static(Vec<Task>),
    Dynamic(GeneratorHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Tool { tool: String, args: Value },
    Batch(BatchSource),
    /// Any other declared type. Not executed by the processor.
    Other(String),
}

impl TaskKind {
    pub fn name(&self) -> &str {
        match self {
            TaskKind::Tool { .. } => "tool",
            TaskKind::Batch(_) => "batch",
            TaskKind::Other(kind) => kind,
        }
    }
}

/// The unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskDocument", into = "TaskDocument")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub description: Option<String>,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Caller-owned bag. Only `retry_count` and `max_retries` are touched by
    /// the processor.
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: TaskStatus::Pending,
            description: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            result: None,
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn tool(id: impl Into<TaskId>, tool: impl Into<String>, args: Value) -> Self {
        Self::new(
            id,
            TaskKind::Tool {
                tool: tool.into(),
                args,
            },
        )
    }

    pub fn batch(id: impl Into<TaskId>, tasks: Vec<Task>) -> Self {
        Self::new(id, TaskKind::Batch(BatchSource::Static(tasks)))
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependents<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependents = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.metadata
            .insert(MAX_RETRIES_KEY.to_string(), Value::from(max_retries));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.kind, TaskKind::Batch(_))
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(RETRY_COUNT_KEY)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.metadata
            .insert(RETRY_COUNT_KEY.to_string(), Value::from(count));
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.metadata
            .get(MAX_RETRIES_KEY)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    }

    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Moves the task to `completed`. A `null` result is stored as `{}` so a
    /// completed task always carries a payload.
    pub fn complete(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(match result {
            Value::Null => Value::Object(Map::new()),
            other => other,
        });
        self.error = None;
        Ok(())
    }

    /// Like [`Task::complete`] but for aggregated payloads that must already
    /// be present.
    pub fn complete_with(&mut self, result: Option<Value>) -> Result<(), TransitionError> {
        match result {
            Some(value) => self.complete(value),
            None => Err(TransitionError::MissingResult {
                id: self.id.clone(),
            }),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Error)?;
        self.error = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

/// Loose wire form of a task, as found in task files. Every field is
/// optional here; [`TaskDocument::into_task`] applies validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskDocument>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<TaskId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependents: Option<Vec<TaskId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TaskDocument {
    /// Validates the document and builds a [`Task`].
    ///
    /// With `require_args`, tool tasks (including nested ones) must declare
    /// `args`; otherwise missing args default to an empty object.
    pub fn into_task(self, require_args: bool) -> Result<Task, ProcessorError> {
        let id = self
            .id
            .ok_or_else(|| ProcessorError::Validation("task is missing an `id`".to_string()))?;

        let kind_name = self.kind.unwrap_or_else(|| {
            if self.tasks.is_some() {
                "batch".to_string()
            } else {
                "tool".to_string()
            }
        });

        let kind = match kind_name.as_str() {
            "tool" => {
                let tool = self.tool.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
                    ProcessorError::Validation(format!("task {}: tool task requires `tool`", id))
                })?;
                let args = match self.args {
                    Some(args) => args,
                    None if require_args => {
                        return Err(ProcessorError::Validation(format!(
                            "task {}: tool task requires `args`",
                            id
                        )));
                    }
                    None => Value::Object(Map::new()),
                };
                TaskKind::Tool { tool, args }
            }
            "batch" => match (self.tasks, self.generator) {
                (Some(tasks), _) => {
                    let tasks = tasks
                        .into_iter()
                        .map(|doc| doc.into_task(require_args))
                        .collect::<Result<Vec<_>, _>>()?;
                    TaskKind::Batch(BatchSource::Static(tasks))
                }
                (None, Some(generator)) => {
                    TaskKind::Batch(BatchSource::Dynamic(GeneratorHandle(generator)))
                }
                (None, None) => {
                    return Err(ProcessorError::Validation(format!(
                        "task {}: batch task requires `tasks` or `generator`",
                        id
                    )));
                }
            },
            _ => TaskKind::Other(kind_name),
        };

        Ok(Task {
            id,
            kind,
            status: self.status.unwrap_or_default(),
            description: self.description,
            dependencies: self.dependencies.unwrap_or_default(),
            dependents: self.dependents.unwrap_or_default(),
            result: self.result,
            error: self.error,
            metadata: self.metadata.unwrap_or_default(),
        })
    }
}

impl TryFrom<TaskDocument> for Task {
    type Error = ProcessorError;

    fn try_from(doc: TaskDocument) -> Result<Self, Self::Error> {
        doc.into_task(false)
    }
}

impl From<Task> for TaskDocument {
    fn from(task: Task) -> Self {
        let mut doc = TaskDocument {
            id: Some(task.id),
            kind: Some(task.kind.name().to_string()),
            status: Some(task.status),
            description: task.description,
            dependencies: (!task.dependencies.is_empty()).then_some(task.dependencies),
            dependents: (!task.dependents.is_empty()).then_some(task.dependents),
            result: task.result,
            error: task.error,
            metadata: (!task.metadata.is_empty()).then_some(task.metadata),
            ..Default::default()
        };

        match task.kind {
            TaskKind::Tool { tool, args } => {
                doc.tool = Some(tool);
                doc.args = Some(args);
            }
            TaskKind::Batch(BatchSource::Static(tasks)) => {
                doc.tasks = Some(tasks.into_iter().map(TaskDocument::from).collect());
            }
            TaskKind::Batch(BatchSource::Dynamic(GeneratorHandle(generator))) => {
                doc.generator = Some(generator);
            }
            TaskKind::Other(_) => {}
        }

        doc
    }
}
