//! Configuration management for flowsmith
//!
//! This module provides repository-level settings: retry budgets for the
//! synthesis pipeline, loop defaults, multi-agent tuning, lane sizes and the
//! chat / runner / memory backends used by the CLI.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{FlowError, Result};

/// Repository-level flowsmith configuration
///
/// Loaded from `.flowsmith/config.toml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Single-pass pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Autonomous loop defaults
    #[serde(default)]
    pub loop_defaults: LoopDefaults,

    /// Coordinator/coder/reviewer tuning
    #[serde(default)]
    pub multi_agent: MultiAgentConfig,

    /// Admission control
    #[serde(default)]
    pub lanes: LanesConfig,

    /// Chat completion backend
    #[serde(default)]
    pub chat: ChatConfig,

    /// External validation runner
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Durable loop memory
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Single-pass pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fix attempts before the pipeline gives up and reports issues
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// System prompt sent with every model call
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Seconds allowed for the intent extraction call
    #[serde(default = "default_intent_timeout_secs")]
    pub intent_timeout_secs: u64,
}

/// Default autonomous loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDefaults {
    /// Maximum iterations before stopping
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Ceiling on the assembled per-iteration prompt
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Consecutive failures that abort the loop
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Tool-call history entries kept in the checkpoint
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Characters of tool output kept per history entry
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,

    /// Identical iterations tolerated before declaring no progress
    #[serde(default = "default_no_progress_limit")]
    pub no_progress_limit: usize,
}

/// Multi-agent decomposition tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentConfig {
    /// Reviewer-fix attempts after a failed execution check
    #[serde(default = "default_reviewer_retries")]
    pub reviewer_retries: usize,

    /// Prompt phrases that mean "ask me what is missing"
    #[serde(default = "default_question_phrases")]
    pub question_phrases: Vec<String>,
}

/// Admission control sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    /// Total concurrent model calls across all sessions
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
}

/// Chat backend configuration (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

/// External validation runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command receiving the document path as its last argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Durable loop memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Root directory for per-session memory; in-process memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

// Default value providers
fn default_max_retries() -> usize {
    2
}

fn default_system_prompt() -> String {
    "You are an operations workflow assistant. You write declarative workflow documents \
     made of host-targeted steps and answer with machine-readable output only."
        .to_string()
}

fn default_intent_timeout_secs() -> u64 {
    8
}

fn default_max_iterations() -> usize {
    6
}

fn default_max_prompt_chars() -> usize {
    14_000
}

fn default_failure_threshold() -> usize {
    2
}

fn default_history_limit() -> usize {
    32
}

fn default_tool_output_limit() -> usize {
    400
}

fn default_no_progress_limit() -> usize {
    2
}

fn default_reviewer_retries() -> usize {
    3
}

fn default_question_phrases() -> Vec<String> {
    [
        "需要补充",
        "需要什么信息",
        "需要哪些信息",
        "你需要什么",
        "你需要哪些",
        "缺什么信息",
        "还缺什么",
        "还需要什么",
        "请问我需要",
        "请问需要",
        "你还要",
        "请问还要",
        "不清楚",
        "不确定",
        "不知道",
        "你问我",
        "问我",
        "请提问",
        "请先确认",
        "帮我确认",
        "请确认",
        "需要确认",
        "确认一下",
        "需要哪些参数",
        "要哪些参数",
        "ask me",
        "what info",
        "what information",
        "what's missing",
        "need more info",
        "missing info",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_global_concurrency() -> usize {
    4
}

fn default_chat_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "FLOWSMITH_API_KEY".to_string()
}

fn default_chat_timeout_secs() -> u64 {
    120
}

impl FlowConfig {
    /// Load configuration from `.flowsmith/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".flowsmith/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FlowError::Other(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.flowsmith/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".flowsmith");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| FlowError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            loop_defaults: LoopDefaults::default(),
            multi_agent: MultiAgentConfig::default(),
            lanes: LanesConfig::default(),
            chat: ChatConfig::default(),
            runner: RunnerConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            system_prompt: default_system_prompt(),
            intent_timeout_secs: default_intent_timeout_secs(),
        }
    }
}

impl Default for LoopDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_prompt_chars: default_max_prompt_chars(),
            failure_threshold: default_failure_threshold(),
            history_limit: default_history_limit(),
            tool_output_limit: default_tool_output_limit(),
            no_progress_limit: default_no_progress_limit(),
        }
    }
}

impl Default for MultiAgentConfig {
    fn default() -> Self {
        Self {
            reviewer_retries: default_reviewer_retries(),
            question_phrases: default_question_phrases(),
        }
    }
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_chat_endpoint(),
            model: default_chat_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.intent_timeout_secs, 8);
        assert_eq!(config.loop_defaults.max_iterations, 6);
        assert_eq!(config.loop_defaults.max_prompt_chars, 14_000);
        assert_eq!(config.loop_defaults.failure_threshold, 2);
        assert_eq!(config.multi_agent.reviewer_retries, 3);
        assert_eq!(config.lanes.global_concurrency, 4);
        assert!(config
            .multi_agent
            .question_phrases
            .iter()
            .any(|p| p == "need more info"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = FlowConfig::from_toml(
            r#"
[loop_defaults]
max_iterations = 9

[multi_agent]
question_phrases = ["tell me what you need"]
"#,
        )
        .unwrap();
        assert_eq!(config.loop_defaults.max_iterations, 9);
        assert_eq!(config.loop_defaults.history_limit, 32);
        assert_eq!(config.multi_agent.reviewer_retries, 3);
        assert_eq!(
            config.multi_agent.question_phrases,
            vec!["tell me what you need".to_string()]
        );
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        FlowConfig::write_default(dir.path()).unwrap();
        assert!(dir.path().join(".flowsmith/config.toml").exists());

        let loaded = FlowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.pipeline.max_retries, 2);
        assert_eq!(loaded.chat.api_key_env, "FLOWSMITH_API_KEY");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = FlowConfig::load_or_default(dir.path()).unwrap();
        assert!(loaded.runner.command.is_none());
        assert!(loaded.memory.root.is_none());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(FlowConfig::from_toml("pipeline = 3").is_err());
    }
}
