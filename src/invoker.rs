use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::BoxTool;

/// Failure raised by a tool. `retryable: Some(false)` opts out of retries;
/// anything else is treated as transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub retryable: Option<bool>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: Some(true),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: Some(false),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable != Some(false)
    }
}

/// Performs the externally visible work named by a tool task.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn execute(&self, tool: &str, args: &Value) -> Result<Value, ToolError>;
}

/// A single named operation, registered in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, args: &Value) -> Result<Value, ToolError>;
}

/// Invoker that dispatches by tool name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, BoxTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: BoxTool) -> Option<BoxTool> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<&BoxTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn execute(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match self.tools.get(tool) {
            Some(handler) => handler.execute(args).await,
            None => Err(ToolError::fatal(format!("unknown tool: {}", tool))),
        }
    }
}
