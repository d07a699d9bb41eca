//! Structural guardrails enforced on every document before it is final

use flowsmith_core::{dedupe_strings, Workflow};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum number of steps a document may carry
pub const MAX_STEP_COUNT: usize = 20;

/// Actions a generated step may use
pub const ALLOWED_ACTIONS: &[&str] = &[
    "cmd.run",
    "template.render",
    "script.shell",
    "script.python",
    "env.set",
];

const DESTRUCTIVE_PATTERNS: &[(&str, &str)] = &[
    ("destructive command detected: rm -rf /", r"(?i)\brm\s+-rf\s+/"),
    ("destructive command detected: mkfs", r"(?i)\bmkfs\b"),
    (
        "destructive command detected: shutdown or reboot",
        r"(?i)\b(shutdown|reboot|poweroff|init\s+0)\b",
    ),
    (
        "destructive command detected: wipefs or dd",
        r"(?i)\b(wipefs|dd\s+if=.*of=/dev)\b",
    ),
];

fn destructive_rules() -> &'static [(String, Regex)] {
    static RULES: OnceLock<Vec<(String, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        DESTRUCTIVE_PATTERNS
            .iter()
            .filter_map(|(reason, pattern)| {
                Regex::new(pattern).ok().map(|re| (reason.to_string(), re))
            })
            .collect()
    })
}

pub fn is_allowed_action(action: &str) -> bool {
    ALLOWED_ACTIONS.contains(&action.trim())
}

/// Comma-separated allow-list for prompts
pub fn allowed_action_text() -> String {
    ALLOWED_ACTIONS.join(", ")
}

/// Guardrail issues for a parsed document and its literal text
///
/// Covers the step ceiling, the action allow-list, missing parameters and
/// destructive commands anywhere in the text.
pub fn guardrail_issues(wf: &Workflow, text: &str) -> Vec<String> {
    let mut issues = Vec::new();

    if wf.steps.len() > MAX_STEP_COUNT {
        issues.push(format!(
            "steps must be <= {} (got {})",
            MAX_STEP_COUNT,
            wf.steps.len()
        ));
    }

    for (i, step) in wf.steps.iter().enumerate() {
        let action = step.action.trim();
        if action.is_empty() {
            continue;
        }
        if !is_allowed_action(action) {
            issues.push(format!("steps[{}] action {:?} is not allowed", i, action));
        }
        if step.with.is_empty() {
            issues.push(format!("steps[{}] with is required", i));
        }
    }

    for (reason, re) in destructive_rules() {
        if re.is_match(text) {
            issues.push(reason.clone());
        }
    }

    dedupe_strings(issues)
}
