//! Tools the autonomous loop may invoke by name

use async_trait::async_trait;
use flowsmith_core::{FlowError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Executes a named tool with structured arguments (allows mocking in tests)
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, args: &Value) -> Result<String>;

    /// Tool names advertised to the model
    fn tool_names(&self) -> Vec<String>;
}

/// Mock tool executor with canned outputs per tool name
#[derive(Default)]
pub struct MockToolExecutor {
    outputs: HashMap<String, std::result::Result<String, String>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, tool: &str, output: impl Into<String>) -> Self {
        self.outputs.insert(tool.to_string(), Ok(output.into()));
        self
    }

    pub fn with_failure(mut self, tool: &str, message: impl Into<String>) -> Self {
        self.outputs.insert(tool.to_string(), Err(message.into()));
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, tool: &str, args: &Value) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((tool.to_string(), args.clone()));
        match self.outputs.get(tool) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(message)) => Err(FlowError::Tool(message.clone())),
            None => Err(FlowError::Tool(format!("unknown tool: {}", tool))),
        }
    }

    fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.keys().cloned().collect();
        names.sort();
        names
    }
}
