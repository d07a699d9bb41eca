//! Snapshot records and session id handling

use flowsmith_planning::Requirements;
use serde::{Deserialize, Serialize};

pub const REQUIREMENTS_FILE: &str = "prd.json";
pub const PROGRESS_FILE: &str = "progress.txt";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Storage key used when a session id normalizes to nothing
pub const DEFAULT_SESSION_ID: &str = "default";

/// Where an autonomous loop left off
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCheckpoint {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub iteration: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tool_calls: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tool_failures: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_fingerprint: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stable_iterations: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_history: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_yaml: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_stop_reasons: Vec<String>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl LoopCheckpoint {
    /// Track a content fingerprint; true once it has repeated `limit` times in a row
    pub fn observe_fingerprint(&mut self, fingerprint: &str, limit: usize) -> bool {
        if limit == 0 || fingerprint.is_empty() {
            return false;
        }
        if self.last_fingerprint == fingerprint {
            self.stable_iterations += 1;
        } else {
            self.stable_iterations = 0;
        }
        self.last_fingerprint = fingerprint.to_string();
        self.stable_iterations >= limit
    }
}

/// Everything remembered about one loop session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMemorySnapshot {
    pub session_id: String,
    pub requirements: Requirements,
    /// Append-only, newline-terminated log
    pub progress: String,
    pub checkpoint: LoopCheckpoint,
}

impl LoopMemorySnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// Lowercase, keep `[a-z0-9._-]`, replace everything else with `-`
pub fn normalize_session_id(session_id: &str) -> String {
    let trimmed = session_id.trim();
    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            'a'..='z' | '0'..='9' | '-' | '_' | '.' => out.push(c),
            'A'..='Z' => out.push(c.to_ascii_lowercase()),
            _ => out.push('-'),
        }
    }
    let out = out.trim_matches(|c| c == '-' || c == '.');
    if out.is_empty() {
        DEFAULT_SESSION_ID.to_string()
    } else {
        out.to_string()
    }
}

/// Append a trimmed line to a progress log, keeping it newline-terminated
pub fn append_progress_line(progress: &mut String, line: &str) {
    if !progress.is_empty() && !progress.ends_with('\n') {
        progress.push('\n');
    }
    let line = line.trim();
    if !line.is_empty() {
        progress.push_str(line);
        progress.push('\n');
    }
}
