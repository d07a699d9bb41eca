//! Regenerating a single step in place, with its neighbours as context

use flowsmith_agent::extract_json_block;
use flowsmith_core::{normalize_questions, FlowError, Result, Step};
use flowsmith_validation::{allowed_action_text, is_allowed_action};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The step being regenerated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegenNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

/// A step before or after the one being regenerated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborStep {
    pub name: String,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegenResult {
    pub step: Step,
    pub questions: Vec<String>,
}

fn push_neighbors(out: &mut String, title: &str, steps: &[NeighborStep]) {
    if steps.is_empty() {
        return;
    }
    out.push_str(title);
    out.push_str(":\n");
    for step in steps {
        out.push_str("- ");
        out.push_str(step.name.trim());
        if !step.action.trim().is_empty() {
            out.push_str(&format!(" ({})", step.action.trim()));
        }
        out.push('\n');
    }
    out.push('\n');
}

pub fn build_regen_prompt(
    intent: &str,
    node: &RegenNode,
    previous: &[NeighborStep],
    next: &[NeighborStep],
    yaml: &str,
) -> String {
    let mut out = String::new();
    out.push_str("You are optimizing a single workflow step. Return JSON only.\n");
    out.push_str("Return JSON with keys: step, questions.\n");
    out.push_str("step must include: name, action, with. Do not include targets.\n");
    out.push_str(&format!("Allowed actions: {}.\n", allowed_action_text()));
    if !intent.trim().is_empty() {
        out.push_str("User intent:\n");
        out.push_str(intent.trim());
        out.push_str("\n\n");
    }
    out.push_str("Current step:\n");
    out.push_str(&format!("name: {}\n", node.name.trim()));
    out.push_str(&format!("action: {}\n", node.action.trim()));
    if !node.with.is_empty() {
        let params = serde_json::to_string(&node.with).unwrap_or_else(|_| "{}".to_string());
        out.push_str(&format!("with: {}\n", params));
    }
    out.push('\n');
    push_neighbors(&mut out, "Previous steps", previous);
    push_neighbors(&mut out, "Next steps", next);
    out.push_str("Workflow YAML (context):\n");
    out.push_str(yaml.trim());
    out.push_str("\n\nReturn JSON only. Do not include markdown or explanations.");
    out
}

#[derive(Deserialize)]
struct StepEnvelope {
    step: Step,
    #[serde(default)]
    questions: Vec<String>,
}

/// Parse `{step, questions}` or a bare step
pub fn parse_regen_reply(reply: &str) -> Result<RegenResult> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse(
            "node regen response is not json".to_string(),
        ));
    }
    let raw: serde_json::Map<String, Value> = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("node regen payload: {}", e)))?;
    if raw.is_empty() {
        return Err(FlowError::Parse("empty node regen payload".to_string()));
    }

    if raw.contains_key("step") {
        let envelope: StepEnvelope = serde_json::from_value(Value::Object(raw))?;
        return Ok(RegenResult {
            step: envelope.step,
            questions: normalize_questions(envelope.questions),
        });
    }
    if raw.contains_key("questions") {
        return Err(FlowError::Parse("step field is required".to_string()));
    }
    let step: Step = serde_json::from_value(Value::Object(raw))?;
    Ok(RegenResult {
        step,
        questions: Vec::new(),
    })
}

/// Trim the step and report name/action problems
pub fn normalize_regen_step(mut step: Step) -> (Step, Vec<String>) {
    let mut issues = Vec::new();
    step.name = step.name.trim().to_string();
    step.action = step.action.trim().to_string();
    if step.name.is_empty() {
        issues.push("step name is required".to_string());
    }
    if step.action.is_empty() {
        issues.push("step action is required".to_string());
    } else if !is_allowed_action(&step.action) {
        issues.push(format!("step action {:?} is not allowed", step.action));
    }
    (step, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_includes_neighbors() {
        let mut node = RegenNode {
            name: "install".to_string(),
            action: "cmd.run".to_string(),
            ..Default::default()
        };
        node.with.insert("cmd".to_string(), json!("apt-get install nginx"));
        let prompt = build_regen_prompt(
            "make it idempotent",
            &node,
            &[NeighborStep {
                name: "update".to_string(),
                action: "cmd.run".to_string(),
            }],
            &[],
            "steps: []",
        );
        assert!(prompt.contains("User intent:\nmake it idempotent"));
        assert!(prompt.contains("Previous steps:\n- update (cmd.run)"));
        assert!(!prompt.contains("Next steps"));
        assert!(prompt.contains("with: {\"cmd\":\"apt-get install nginx\"}"));
    }

    #[test]
    fn test_parse_envelope() {
        let result = parse_regen_reply(
            r#"{"step":{"name":"install","action":"cmd.run","with":{"cmd":"x"}},"questions":[" which os? "]}"#,
        )
        .unwrap();
        assert_eq!(result.step.name, "install");
        assert_eq!(result.questions, vec!["which os?".to_string()]);
    }

    #[test]
    fn test_parse_bare_step() {
        let result = parse_regen_reply(r#"{"name":"install","action":"cmd.run"}"#).unwrap();
        assert_eq!(result.step.action, "cmd.run");
        assert!(result.questions.is_empty());
    }

    #[test]
    fn test_parse_questions_without_step() {
        let err = parse_regen_reply(r#"{"questions":["?"]}"#).unwrap_err();
        assert!(err.to_string().contains("step field is required"));
        assert!(parse_regen_reply("{}").is_err());
        assert!(parse_regen_reply("nope").is_err());
    }

    #[test]
    fn test_normalize_step() {
        let (step, issues) = normalize_regen_step(Step {
            name: " a ".to_string(),
            action: "shell".to_string(),
            ..Default::default()
        });
        assert_eq!(step.name, "a");
        assert_eq!(issues, vec!["step action \"shell\" is not allowed".to_string()]);
    }
}
