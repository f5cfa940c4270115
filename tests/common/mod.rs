#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskcuter::{
    EmbeddingRecord, EnhancementHook, ExecutionOutcome, FallbackStore, HookError, Recommendations,
    RetryPolicy, TaskContext, TaskProcessor, TaskSummary, ToolError, ToolInvoker,
};

/// Invoker with a fixed repertoire:
/// `noop` and `echo` succeed, `fail` fails for good, `flaky` always fails
/// transiently, `flaky-once` fails transiently on its first call only.
#[derive(Default)]
pub struct ScriptedInvoker {
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self, tool: &str) -> u32 {
        self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn execute(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(tool.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        match tool {
            "noop" => Ok(json!({"ok": true})),
            "echo" => Ok(args.clone()),
            "fail" => Err(ToolError::fatal("disk full")),
            "flaky" => Err(ToolError::new("connection reset")),
            "flaky-once" if call == 1 => Err(ToolError::transient("timeout")),
            "flaky-once" => Ok(json!({"attempt": call})),
            other => Err(ToolError::fatal(format!("unknown tool: {}", other))),
        }
    }
}

/// Hook whose every call fails.
pub struct FailingHook;

#[async_trait]
impl EnhancementHook for FailingHook {
    async fn pre_execute(&self, _task: &TaskSummary) -> Result<Recommendations, HookError> {
        Err(HookError::Hook("recommendation service down".to_string()))
    }

    async fn post_execute(
        &self,
        _task: &TaskContext,
        _outcome: &ExecutionOutcome,
    ) -> Result<(), HookError> {
        Err(HookError::Hook("vector store down".to_string()))
    }
}

/// Hook that remembers what it was shown.
#[derive(Default)]
pub struct RecordingHook {
    pub pre: Mutex<Vec<TaskSummary>>,
    pub post: Mutex<Vec<(TaskContext, ExecutionOutcome)>>,
}

#[async_trait]
impl EnhancementHook for RecordingHook {
    async fn pre_execute(&self, task: &TaskSummary) -> Result<Recommendations, HookError> {
        self.pre.lock().unwrap().push(task.clone());
        Ok(Recommendations {
            recommendations: vec!["use the cached transcript".to_string()],
        })
    }

    async fn post_execute(
        &self,
        task: &TaskContext,
        outcome: &ExecutionOutcome,
    ) -> Result<(), HookError> {
        self.post
            .lock()
            .unwrap()
            .push((task.clone(), outcome.clone()));
        Ok(())
    }
}

/// Fallback store that keeps records in memory, or refuses them.
#[derive(Default)]
pub struct MemoryStore {
    pub refuse: bool,
    pub records: Mutex<Vec<EmbeddingRecord>>,
}

#[async_trait]
impl FallbackStore for MemoryStore {
    async fn persist(&self, record: &EmbeddingRecord) -> Result<(), HookError> {
        if self.refuse {
            return Err(HookError::Hook("fallback unavailable".to_string()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub fn instant_retries() -> RetryPolicy {
    RetryPolicy::fixed(Duration::ZERO)
}

pub fn processor(invoker: Arc<ScriptedInvoker>) -> TaskProcessor {
    TaskProcessor::builder(invoker)
        .retry_policy(instant_retries())
        .build()
}
