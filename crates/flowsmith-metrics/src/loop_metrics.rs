//! Metrics recorded on every loop exit

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why an autonomous loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    #[default]
    Error,
    MaxIters,
    ContextCanceled,
    BudgetExceeded,
    NoProgress,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
            Self::MaxIters => "max_iters",
            Self::ContextCanceled => "context_canceled",
            Self::BudgetExceeded => "budget_exceeded",
            Self::NoProgress => "no_progress",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "error" | "" => Ok(Self::Error),
            "max_iters" => Ok(Self::MaxIters),
            "context_canceled" => Ok(Self::ContextCanceled),
            "budget_exceeded" => Ok(Self::BudgetExceeded),
            "no_progress" => Ok(Self::NoProgress),
            _ => Err(format!("Unknown termination reason: {}", s)),
        }
    }
}

/// Outcome of one named completion check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl CompletionCheckResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            reason: String::new(),
        }
    }

    pub fn fail(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            reason: reason.into(),
        }
    }
}

/// How far a loop run got, recorded even when it fails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub loop_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode_profile: String,
    pub iterations: usize,
    pub tool_calls: usize,
    pub tool_failures: usize,
    pub duration_ms: u64,
    pub terminal: TerminationReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CompletionCheckResult>,
    /// Loop memory fell back to the in-process store
    #[serde(default)]
    pub non_durable: bool,
}

impl LoopMetrics {
    pub fn is_completed(&self) -> bool {
        self.terminal == TerminationReason::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trip() {
        for reason in [
            TerminationReason::Completed,
            TerminationReason::MaxIters,
            TerminationReason::ContextCanceled,
            TerminationReason::NoProgress,
        ] {
            assert_eq!(reason.as_str().parse::<TerminationReason>().unwrap(), reason);
        }
        assert!("later".parse::<TerminationReason>().is_err());
    }

    #[test]
    fn test_reason_serde_matches_display() {
        let text = serde_json::to_string(&TerminationReason::BudgetExceeded).unwrap();
        assert_eq!(text, "\"budget_exceeded\"");
    }
}
