//! Per-step sub-plans for the coordinator loop
//!
//! For each plan step the model writes a YAML fragment holding only step
//! entries. A second call reviews the fragment and lists what is wrong with
//! it; an empty list means the fragment is accepted.

use flowsmith_agent::extract_json_block;
use flowsmith_core::{normalize_questions, FlowError, Result};
use flowsmith_validation::allowed_action_text;
use serde::Deserialize;

use crate::plan::PlanStep;

pub const SUBLOOP_SYSTEM_PROMPT: &str =
    "You are a workflow step writer. Return JSON only.";
pub const SUBLOOP_REVIEW_SYSTEM_PROMPT: &str =
    "You are a workflow step reviewer. Return JSON only.";

const TOP_LEVEL_KEYS: [&str; 3] = ["version", "inventory", "plan"];

pub fn build_subloop_prompt(step: &PlanStep, issues: &[String]) -> String {
    let mut out = String::new();
    out.push_str("Write the workflow steps for one plan step.\n");
    out.push_str("Output format: {\"yaml_fragment\":\"- name: ...\\n  action: ...\\n  with:\\n    ...\"}\n");
    out.push_str("The fragment is a YAML list of steps only. Do not include version, inventory or plan.\n");
    out.push_str(&format!("Allowed actions: {}.\n\n", allowed_action_text()));
    out.push_str("Plan step:\n");
    out.push_str(&format!("- name: {}", step.step_name.trim()));
    if !step.description.trim().is_empty() {
        out.push_str(&format!("\n- description: {}", step.description.trim()));
    }
    out.push_str("\n\n");
    if !issues.is_empty() {
        out.push_str("Fix these issues from the previous attempt:\n");
        for issue in issues {
            out.push_str(&format!("- {}\n", issue));
        }
        out.push('\n');
    }
    out.push_str("Use the plan step name as the name of its main step. Return JSON only.");
    out
}

#[derive(Deserialize)]
struct FragmentPayload {
    #[serde(default)]
    yaml_fragment: String,
}

/// Pull the trimmed `yaml_fragment` out of a step-writer reply
pub fn parse_subloop_reply(reply: &str) -> Result<String> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse("subloop response is not json".to_string()));
    }
    let payload: FragmentPayload = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("subloop payload: {}", e)))?;
    let fragment = payload.yaml_fragment.trim();
    if fragment.is_empty() {
        return Err(FlowError::Parse("yaml_fragment is empty".to_string()));
    }
    Ok(fragment.to_string())
}

/// Reject fragments that are not a step list aimed at `step`
pub fn validate_sub_plan(fragment: &str, step: &PlanStep) -> Result<()> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return Err(FlowError::ValidationFailed("yaml fragment is empty".to_string()));
    }
    for key in TOP_LEVEL_KEYS {
        let prefix = format!("{}:", key);
        if trimmed.lines().any(|line| line.trim().starts_with(&prefix)) {
            return Err(FlowError::ValidationFailed(format!(
                "sub plan must not include top-level {}",
                key
            )));
        }
    }
    if !trimmed.contains("- name:") {
        return Err(FlowError::ValidationFailed(
            "sub plan must include a step name".to_string(),
        ));
    }
    let name = step.step_name.trim();
    if !name.is_empty() && !trimmed.contains(name) {
        return Err(FlowError::ValidationFailed(format!(
            "sub plan must target step {:?}",
            name
        )));
    }
    Ok(())
}

pub fn build_fragment_review_prompt(fragment: &str, known_issues: &[String]) -> String {
    let mut out = String::new();
    out.push_str("Review these workflow steps.\n");
    out.push_str("Output format: {\"issues\":[\"...\"]}\n");
    out.push_str("Return an empty issues list when the steps are correct, safe and executable.\n");
    out.push_str(&format!("Allowed actions: {}.\n\n", allowed_action_text()));
    if !known_issues.is_empty() {
        out.push_str("Previously reported issues:\n");
        for issue in known_issues {
            out.push_str(&format!("- {}\n", issue));
        }
        out.push('\n');
    }
    out.push_str("Steps:\n");
    out.push_str(fragment.trim());
    out.push_str("\n\nReturn JSON only.");
    out
}

#[derive(Deserialize)]
struct ReviewPayload {
    #[serde(default)]
    issues: Vec<String>,
}

/// Reviewer issues, trimmed and deduplicated
pub fn parse_review_issues(reply: &str) -> Result<Vec<String>> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse("review response is not json".to_string()));
    }
    let payload: ReviewPayload = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("review payload: {}", e)))?;
    Ok(normalize_questions(payload.issues))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: &str = "- name: install\n  action: cmd.run\n  with:\n    cmd: echo hi";

    #[test]
    fn test_parse_fragment() {
        let reply = serde_json::json!({ "yaml_fragment": format!("  {}\n", FRAGMENT) }).to_string();
        assert_eq!(parse_subloop_reply(&reply).unwrap(), FRAGMENT);

        let err = parse_subloop_reply("here are your steps").unwrap_err();
        assert_eq!(err.to_string(), "parse error: subloop response is not json");
        let err = parse_subloop_reply(r#"{"yaml_fragment":"  "}"#).unwrap_err();
        assert!(err.to_string().contains("yaml_fragment is empty"));
    }

    #[test]
    fn test_sub_plan_checks() {
        let step = PlanStep::new("install");
        assert!(validate_sub_plan(FRAGMENT, &step).is_ok());

        let err = validate_sub_plan(&format!("version: v1\n{}", FRAGMENT), &step).unwrap_err();
        assert!(err.to_string().contains("must not include top-level version"));
        let err = validate_sub_plan("  inventory:\n    hosts: {}", &step).unwrap_err();
        assert!(err.to_string().contains("top-level inventory"));
        let err = validate_sub_plan("action: cmd.run", &step).unwrap_err();
        assert!(err.to_string().contains("must include a step name"));
        let err = validate_sub_plan(FRAGMENT, &PlanStep::new("restart nginx")).unwrap_err();
        assert!(err.to_string().contains("must target step \"restart nginx\""));
        assert!(validate_sub_plan(FRAGMENT, &PlanStep::default()).is_ok());
        assert!(validate_sub_plan(" ", &step).is_err());
    }

    #[test]
    fn test_review_issues() {
        let issues = parse_review_issues(r#"{"issues":[" missing guardrail ","missing guardrail",""]}"#)
            .unwrap();
        assert_eq!(issues, vec!["missing guardrail".to_string()]);
        assert!(parse_review_issues(r#"{"issues":[]}"#).unwrap().is_empty());
        assert!(parse_review_issues("looks fine").is_err());
    }

    #[test]
    fn test_prompts_carry_feedback() {
        let step = PlanStep::new("install").with_description("install nginx");
        let prompt = build_subloop_prompt(&step, &["missing guardrail".to_string()]);
        assert!(prompt.contains("- name: install\n- description: install nginx"));
        assert!(prompt.contains("Fix these issues from the previous attempt:\n- missing guardrail"));

        let review = build_fragment_review_prompt(FRAGMENT, &[]);
        assert!(review.ends_with(&format!("Steps:\n{}\n\nReturn JSON only.", FRAGMENT)));
        assert!(!review.contains("Previously reported"));
    }
}
