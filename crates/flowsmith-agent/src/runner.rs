//! External validation runner
//!
//! A runner executes a document inside a named environment and reports
//! `{status, stdout, stderr, exit_code}`. The engine never runs steps on
//! hosts itself.

use async_trait::async_trait;
use flowsmith_core::{ExecutionResult, FlowError, Result, ValidationEnv};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs a document against a validation environment (allows mocking in tests)
#[async_trait]
pub trait ValidationRunner: Send + Sync {
    async fn run(&self, env: &ValidationEnv, yaml: &str) -> Result<ExecutionResult>;
}

/// Runs an external command with the document path as its last argument
///
/// The environment name is exported as `FLOWSMITH_ENV`. Dropping the run
/// future kills the child and removes the scratch document.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandRunner {
    /// Build from a whitespace-separated command line
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| FlowError::InvalidInput("runner command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            scratch_dir: std::env::temp_dir(),
        })
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

#[async_trait]
impl ValidationRunner for CommandRunner {
    #[instrument(skip(self, yaml), fields(program = %self.program, env = %env.name))]
    async fn run(&self, env: &ValidationEnv, yaml: &str) -> Result<ExecutionResult> {
        let mut scratch = tempfile::Builder::new()
            .prefix("flowsmith-")
            .suffix(".yaml")
            .tempfile_in(&self.scratch_dir)?;
        scratch.write_all(yaml.as_bytes())?;
        scratch.flush()?;

        debug!(
            "Executing {} {:?} {}",
            self.program,
            self.args,
            scratch.path().display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(scratch.path())
            .env("FLOWSMITH_ENV", &env.name)
            .kill_on_drop(true)
            .output()
            .await;
        drop(scratch);

        let output = output
            .map_err(|e| FlowError::Runner(format!("Failed to execute {}: {}", self.program, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(ExecutionResult::success(stdout))
        } else {
            let mut result = ExecutionResult::failure(stderr, output.status.code().unwrap_or(-1));
            result.stdout = stdout;
            debug!("runner failed: exit={}", result.exit_code);
            Ok(result)
        }
    }
}

/// Mock runner returning scripted results, then the fallback
pub struct MockRunner {
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: ExecutionResult,
    runs: Mutex<Vec<String>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// A runner that always succeeds
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ExecutionResult::success(""),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_result(self, result: ExecutionResult) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    pub fn with_fallback(mut self, result: ExecutionResult) -> Self {
        self.fallback = result;
        self
    }

    /// Documents received so far
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ValidationRunner for MockRunner {
    async fn run(&self, _env: &ValidationEnv, yaml: &str) -> Result<ExecutionResult> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(yaml.to_string());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
