//! Intent extraction for single-pass generation
//!
//! Before generating, the pipeline asks the model what the request is
//! about and which inputs are missing. A non-empty `missing` list turns
//! the run into a clarifying-question response.

use flowsmith_agent::extract_json_block;
use flowsmith_core::{FlowError, Result};
use serde::{Deserialize, Serialize};

use crate::questions::normalize_missing;

pub const INTENT_SYSTEM_PROMPT: &str = "You are a workflow intent extractor. Return JSON only.";

/// Missing key recorded for a bare greeting
pub const GREETING_MISSING_KEY: &str = "goal";

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hiya",
    "yo",
    "sup",
    "hithere",
    "hellothere",
    "heythere",
    "你好",
    "您好",
    "嗨",
    "哈喽",
    "在吗",
    "早上好",
    "中午好",
    "下午好",
    "晚上好",
];

/// What the user wants, as understood by the intent extractor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    /// Inputs needed before executable steps can be written
    #[serde(default)]
    pub missing: Vec<String>,
}

impl Intent {
    /// The intent recorded for a greeting: nothing known, goal missing
    pub fn greeting() -> Self {
        Self {
            missing: vec![GREETING_MISSING_KEY.to_string()],
            ..Default::default()
        }
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }
}

pub fn build_intent_prompt(prompt: &str, context: &str) -> String {
    let mut out = String::new();
    if !context.trim().is_empty() {
        out.push_str("Context:\n");
        out.push_str(context.trim());
        out.push_str("\n\n");
    }
    out.push_str("User request:\n");
    out.push_str(prompt.trim());
    out.push_str("\n\n");
    out.push_str("Return JSON only with keys: goal, targets, constraints, resources, actions, missing. ");
    out.push_str("missing should list fields needed to build executable steps. Do not include markdown.");
    out
}

/// Parse the extractor reply; `missing` comes back normalized
pub fn parse_intent_reply(reply: &str) -> Result<Intent> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse("intent response is not json".to_string()));
    }
    let mut intent: Intent = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("intent payload: {}", e)))?;
    intent.missing = normalize_missing(&intent.missing);
    Ok(intent)
}

/// Whether the whole request is just a salutation
///
/// Case, whitespace and punctuation are ignored.
pub fn is_greeting_prompt(prompt: &str) -> bool {
    let token: String = prompt
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    if token.is_empty() {
        return false;
    }
    GREETINGS.contains(&token.as_str()) || (token.starts_with("你好") && token.chars().count() <= 3)
}
