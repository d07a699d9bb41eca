//! Step patches: the coder's (or reviewer's) realization of one plan step

use crate::plan::{plan_step_id, PlanStep};
use flowsmith_agent::extract_json_block;
use flowsmith_core::{FlowError, Result, Step, StepStatus};
use flowsmith_validation::{allowed_action_text, is_allowed_action};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who produced a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchSource {
    Coder,
    Reviewer,
}

impl std::fmt::Display for PatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coder => write!(f, "coder"),
            Self::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// A single-step update; top-level document fields are rejected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepPatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_id: String,
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PatchSource>,
}

impl StepPatch {
    pub fn new(step_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.with.insert(key.into(), value);
        self
    }

    pub fn with_source(mut self, source: PatchSource) -> Self {
        self.source = Some(source);
        self
    }

    /// The document step this patch describes
    pub fn to_step(&self) -> Step {
        Step {
            name: self.step_name.clone(),
            targets: self.targets.clone(),
            action: self.action.clone(),
            with: self.with.clone(),
            ..Default::default()
        }
    }
}

/// Reviewer verdict for one step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default)]
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ReviewResult {
    pub fn passed(&self) -> bool {
        self.status != StepStatus::Failed
    }
}

/// Parse and normalize a patch from a model reply
///
/// Unknown fields, a missing name or action, and actions outside the
/// allow-list are all errors.
pub fn parse_step_patch(reply: &str) -> Result<StepPatch> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse(
            "step patch response is not json".to_string(),
        ));
    }
    let patch: StepPatch = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("step patch: {}", e)))?;
    normalize_step_patch(patch)
}

fn normalize_step_patch(mut patch: StepPatch) -> Result<StepPatch> {
    patch.step_name = patch.step_name.trim().to_string();
    patch.step_id = patch.step_id.trim().to_string();
    patch.action = patch.action.trim().to_string();
    patch.summary = patch.summary.trim().to_string();

    if patch.step_name.is_empty() {
        return Err(FlowError::Parse("step_name is required".to_string()));
    }
    if patch.step_id.is_empty() {
        patch.step_id = plan_step_id(&patch.step_name, 0);
    }
    if patch.action.is_empty() {
        return Err(FlowError::Parse("action is required".to_string()));
    }
    if !is_allowed_action(&patch.action) {
        return Err(FlowError::Parse(format!(
            "action {:?} is not allowed",
            patch.action
        )));
    }
    if patch.summary.is_empty() {
        patch.summary = format!("{} · {}", patch.step_name, patch.action);
    }
    Ok(patch)
}

/// Structural issues of a patch (empty when it is acceptable)
pub fn validate_step_patch(patch: &StepPatch) -> Vec<String> {
    let mut issues = Vec::new();
    if patch.step_name.trim().is_empty() {
        issues.push("step_name is required".to_string());
    }
    let action = patch.action.trim();
    if action.is_empty() {
        issues.push("action is required".to_string());
    } else if !is_allowed_action(action) {
        issues.push(format!("action {:?} is not allowed", patch.action));
    }
    issues
}

/// Point a patch at its plan step: keep a known id, else match by name
pub fn align_step_patch(plan: &[PlanStep], mut patch: StepPatch) -> StepPatch {
    if plan.is_empty() {
        return patch;
    }
    if !patch.step_id.is_empty() && plan.iter().any(|s| s.id == patch.step_id) {
        return patch;
    }
    if let Some(step) = plan
        .iter()
        .find(|s| s.step_name.eq_ignore_ascii_case(&patch.step_name))
    {
        patch.step_id = step.id.clone();
    }
    patch
}

const PATCH_FORMAT: &str = "Output format: {\"step_id\":\"...\",\"step_name\":\"...\",\"action\":\"...\",\"targets\":[],\"with\":{},\"summary\":\"...\"}\n";

pub fn build_coder_prompt(step: &PlanStep, context: &str) -> String {
    let mut out = String::new();
    out.push_str("You are a workflow coder. Return JSON only.\n");
    out.push_str(PATCH_FORMAT);
    out.push_str(&format!("Allowed actions: {}.\n", allowed_action_text()));
    if !context.trim().is_empty() {
        out.push_str("Context:\n");
        out.push_str(context.trim());
        out.push_str("\n\n");
    }
    out.push_str("Plan step:\n");
    out.push_str(&format!("- id: {}\n", step.id.trim()));
    out.push_str(&format!("- name: {}", step.step_name.trim()));
    if !step.description.trim().is_empty() {
        out.push_str(&format!("\n- description: {}", step.description.trim()));
    }
    out.push_str("\n\nReturn JSON only. Do not include markdown.");
    out
}

pub fn build_reviewer_prompt(patch: &StepPatch, issues: &[String], exec_error: &str) -> String {
    let mut out = String::new();
    out.push_str("You are a workflow reviewer. Fix the step JSON and return JSON only.\n");
    out.push_str(PATCH_FORMAT);
    out.push_str(&format!("Allowed actions: {}.\n\n", allowed_action_text()));
    if !issues.is_empty() {
        out.push_str("Issues:\n");
        for issue in issues {
            out.push_str(&format!("- {}\n", issue));
        }
        out.push('\n');
    }
    if !exec_error.trim().is_empty() {
        out.push_str("Execution error:\n");
        out.push_str(exec_error.trim());
        out.push_str("\n\n");
    }
    out.push_str("Current step:\n");
    out.push_str(&serde_json::to_string(patch).unwrap_or_default());
    out.push_str("\n\nReturn JSON only.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fills_defaults() {
        let patch = parse_step_patch(
            r#"{"step_name":" Install nginx ","action":"cmd.run","with":{"cmd":"apt-get install -y nginx"}}"#,
        )
        .unwrap();
        assert_eq!(patch.step_name, "Install nginx");
        assert_eq!(patch.step_id, "step-1-install-nginx");
        assert_eq!(patch.summary, "Install nginx · cmd.run");
        assert_eq!(patch.with["cmd"], json!("apt-get install -y nginx"));
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let err = parse_step_patch(r#"{"step_name":"a","action":"cmd.run","inventory":{}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("inventory"));
    }

    #[test]
    fn test_parse_rejects_disallowed_action() {
        let err = parse_step_patch(r#"{"step_name":"a","action":"file.copy"}"#).unwrap_err();
        assert!(err.to_string().contains("is not allowed"));
        assert!(parse_step_patch(r#"{"step_name":"a"}"#).is_err());
        assert!(parse_step_patch("no json here").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(validate_step_patch(&StepPatch::new("a", "cmd.run")).is_empty());
        assert_eq!(
            validate_step_patch(&StepPatch::new("", "")),
            vec!["step_name is required", "action is required"]
        );
        assert_eq!(
            validate_step_patch(&StepPatch::new("a", "rm")),
            vec!["action \"rm\" is not allowed"]
        );
    }

    #[test]
    fn test_align_by_id_then_name() {
        let mut plan = vec![PlanStep::new("Install"), PlanStep::new("Start")];
        crate::plan::assign_plan_ids(&mut plan);

        let mut by_id = StepPatch::new("whatever", "cmd.run");
        by_id.step_id = plan[1].id.clone();
        assert_eq!(align_step_patch(&plan, by_id).step_id, plan[1].id);

        let by_name = StepPatch::new("start", "cmd.run");
        assert_eq!(align_step_patch(&plan, by_name).step_id, plan[1].id);

        let mut unknown = StepPatch::new("other", "cmd.run");
        unknown.step_id = "x".to_string();
        assert_eq!(align_step_patch(&plan, unknown).step_id, "x");
    }

    #[test]
    fn test_reviewer_prompt_carries_context() {
        let patch = StepPatch::new("a", "file.copy");
        let prompt = build_reviewer_prompt(&patch, &["bad action".to_string()], "exit 1");
        assert!(prompt.contains("- bad action"));
        assert!(prompt.contains("Execution error:\nexit 1"));
        assert!(prompt.contains("\"action\":\"file.copy\""));
    }

    #[test]
    fn test_to_step() {
        let step = StepPatch::new("a", "cmd.run")
            .with_param("cmd", json!("true"))
            .to_step();
        assert_eq!(step.name, "a");
        assert_eq!(step.with["cmd"], json!("true"));
    }
}
