//! Per-run state, options and the error carrying partial state

use flowsmith_agent::ToolExecutor;
use flowsmith_core::{
    Event, EventSink, ExecutionResult, FlowError, Mode, RiskLevel, ValidationEnv,
};
use flowsmith_memory::LoopMemoryStore;
use flowsmith_metrics::LoopMetrics;
use flowsmith_planning::{Intent, PlanStep};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything one synthesis run knows; created fresh per call
#[derive(Debug, Clone, Default, Serialize)]
pub struct SynthesisState {
    pub mode: Mode,
    pub prompt: String,
    pub context: String,
    pub system_prompt: String,
    /// What the request is about; set before generation in generate mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Caller-supplied document whose non-step fields are preserved
    pub base_yaml: String,
    pub yaml: String,
    pub issues: Vec<String>,
    /// Rewrites the normalizer applied on the caller's behalf
    pub notices: Vec<String>,
    pub risk_level: RiskLevel,
    pub risk_notes: Vec<String>,
    pub retry_count: usize,
    pub max_retries: usize,
    pub skip_execute: bool,
    pub execution_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<ValidationEnv>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
    pub is_success: bool,
    pub needs_review: bool,
    pub last_error: String,
    /// Previous document versions, oldest first
    pub history: Vec<String>,
    pub questions: Vec<String>,
    pub thought: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_metrics: Option<LoopMetrics>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub draft_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanStep>,
    /// A multi-agent run stopped at its pause point
    pub paused: bool,
}

impl SynthesisState {
    pub(crate) fn new(mode: Mode, prompt: &str, opts: &RunOptions, defaults: (usize, &str)) -> Self {
        let (max_retries, system_prompt) = defaults;
        Self {
            mode,
            prompt: prompt.trim().to_string(),
            context: opts.context.trim().to_string(),
            system_prompt: opts
                .system_prompt
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(system_prompt)
                .to_string(),
            base_yaml: opts.base_yaml.trim().to_string(),
            max_retries: opts.max_retries.unwrap_or(max_retries),
            skip_execute: opts.skip_execute,
            env: opts.env.clone(),
            ..Default::default()
        }
    }

    /// Apply the human-gate rule
    pub fn review_required(&self) -> bool {
        self.risk_level != RiskLevel::Low || !self.issues.is_empty() || !self.is_success
    }
}

/// Autonomous loop profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopProfile {
    #[default]
    Default,
    /// Durable memory, completion checks and no-progress detection
    Ralph,
}

impl LoopProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ralph => "ralph",
        }
    }
}

impl std::fmt::Display for LoopProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoopProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" | "" => Ok(Self::Default),
            "ralph" => Ok(Self::Ralph),
            _ => Err(format!("Invalid loop profile: {}", s)),
        }
    }
}

/// Caller options shared by every entry point
///
/// Fields that only matter to one entry point are ignored by the others.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub context: String,
    pub system_prompt: Option<String>,
    pub max_retries: Option<usize>,
    pub base_yaml: String,
    pub env: Option<ValidationEnv>,
    pub skip_execute: bool,
    pub event_sink: Option<EventSink>,
    pub cancel: CancellationToken,

    // Autonomous loop
    pub max_iterations: Option<usize>,
    pub tools: Option<Arc<dyn ToolExecutor>>,
    pub fallback_to_pipeline: bool,
    pub profile: LoopProfile,
    pub completion_checks: Vec<String>,
    pub completion_token: String,
    pub no_progress_limit: Option<usize>,
    /// Zero means unlimited
    pub max_tool_calls: usize,
    /// Iterations plus tool calls; zero means unlimited
    pub max_budget_units: usize,
    pub per_iteration_timeout: Option<Duration>,
    pub memory_store: Option<Arc<dyn LoopMemoryStore>>,
    pub memory_root: Option<PathBuf>,

    // Multi-agent
    pub draft_id: String,
    pub session_key: String,
    pub checkpoint_id: String,
    pub resume_checkpoint_id: String,
    /// Plan step id or name to pause after
    pub pause_after_step: String,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_base_yaml(mut self, base_yaml: impl Into<String>) -> Self {
        self.base_yaml = base_yaml.into();
        self
    }

    pub fn with_env(mut self, env: ValidationEnv) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn skip_execution(mut self) -> Self {
        self.skip_execute = true;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_profile(mut self, profile: LoopProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_completion_checks(mut self, checks: Vec<String>) -> Self {
        self.completion_checks = checks;
        self
    }

    pub fn with_completion_token(mut self, token: impl Into<String>) -> Self {
        self.completion_token = token.into();
        self
    }

    pub fn with_no_progress_limit(mut self, limit: usize) -> Self {
        self.no_progress_limit = Some(limit);
        self
    }

    pub fn with_max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = max_tool_calls;
        self
    }

    pub fn with_max_budget_units(mut self, units: usize) -> Self {
        self.max_budget_units = units;
        self
    }

    pub fn with_per_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.per_iteration_timeout = Some(timeout);
        self
    }

    /// Run the single-pass pipeline if the loop fails
    pub fn with_fallback_to_pipeline(mut self) -> Self {
        self.fallback_to_pipeline = true;
        self
    }

    pub fn with_memory_store(mut self, store: Arc<dyn LoopMemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn with_memory_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.memory_root = Some(root.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = checkpoint_id.into();
        self
    }

    pub fn with_resume_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.resume_checkpoint_id = checkpoint_id.into();
        self
    }

    pub fn with_pause_after_step(mut self, step: impl Into<String>) -> Self {
        self.pause_after_step = step.into();
        self
    }

    pub fn with_draft_id(mut self, draft_id: impl Into<String>) -> Self {
        self.draft_id = draft_id.into();
        self
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = session_key.into();
        self
    }
}

/// A failed run together with the state it reached
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: FlowError,
    pub state: Box<SynthesisState>,
}

impl RunError {
    pub fn new(error: FlowError, state: SynthesisState) -> Self {
        Self {
            error,
            state: Box::new(state),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}

pub type RunResult = std::result::Result<SynthesisState, RunError>;

/// Agent identity stamped onto events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl AgentIdentity {
    pub fn new(name: &str, role: &str) -> Self {
        Self {
            id: role.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        }
    }
}

/// Forwards events to the caller's sink, if any
#[derive(Clone, Default)]
pub(crate) struct Emitter {
    sink: Option<EventSink>,
    agent: Option<AgentIdentity>,
}

impl Emitter {
    pub(crate) fn new(sink: Option<EventSink>) -> Self {
        Self { sink, agent: None }
    }

    /// A copy stamping `agent` onto events that carry no agent of their own
    pub(crate) fn with_agent(&self, agent: AgentIdentity) -> Self {
        Self {
            sink: self.sink.clone(),
            agent: Some(agent),
        }
    }

    pub(crate) fn emit(&self, mut event: Event) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Some(agent) = &self.agent {
            if event.agent_name.is_empty() {
                event = event.with_agent(&agent.id, &agent.name, &agent.role);
            }
        }
        sink(event);
    }
}
