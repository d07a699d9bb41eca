//! Plan steps produced by the coordinator

use flowsmith_agent::extract_json_block;
use flowsmith_core::{FlowError, Result, StepStatus};
use serde::{Deserialize, Serialize};

use crate::questions::normalize_missing;

/// Name of the single step used when the coordinator returns no plan
pub const FALLBACK_STEP_NAME: &str = "generate workflow steps";
const FALLBACK_DESCRIPTION: &str = "generate executable workflow steps";

/// One step of a coordinator plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Derived from the step name once the step is admitted into a draft
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
}

impl PlanStep {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Derive a stable step id: `step-{n}` plus a slug of the name when it has one
pub fn plan_step_id(step_name: &str, index: usize) -> String {
    let mut slug = String::new();
    for c in step_name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        format!("step-{}", index + 1)
    } else {
        format!("step-{}-{}", index + 1, slug)
    }
}

/// Give every step without an id one derived from its position
pub fn assign_plan_ids(plan: &mut [PlanStep]) {
    for (i, step) in plan.iter_mut().enumerate() {
        if step.id.trim().is_empty() {
            step.id = plan_step_id(&step.step_name, i);
        }
    }
}

/// Drop nameless steps and trim every field
pub fn normalize_plan_steps(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    steps
        .into_iter()
        .filter_map(|step| {
            let name = step.step_name.trim();
            if name.is_empty() {
                return None;
            }
            Some(PlanStep {
                id: step.id.trim().to_string(),
                step_name: name.to_string(),
                description: step.description.trim().to_string(),
                dependencies: step
                    .dependencies
                    .iter()
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect(),
                status: step.status,
            })
        })
        .collect()
}

/// A single generic step covering the whole request
pub fn fallback_plan(prompt: &str) -> Vec<PlanStep> {
    let description = match prompt.trim() {
        "" => FALLBACK_DESCRIPTION,
        text => text,
    };
    let mut plan = normalize_plan_steps(vec![
        PlanStep::new(FALLBACK_STEP_NAME).with_description(description)
    ]);
    assign_plan_ids(&mut plan);
    plan
}

pub fn build_coordinator_prompt(prompt: &str, context: &str) -> String {
    let mut out = String::new();
    out.push_str("You are a workflow coordinator. Return JSON only.\n");
    out.push_str("Output format: {\"plan\":[{\"step_name\":\"...\",\"description\":\"...\",\"dependencies\":[]}],\"missing\":[]}\n");
    out.push_str("Do not ask for missing information unless the user explicitly requests questions; assume reasonable defaults and keep missing empty.\n");
    if !context.trim().is_empty() {
        out.push_str("Context:\n");
        out.push_str(context.trim());
        out.push_str("\n\n");
    }
    out.push_str("User request:\n");
    out.push_str(prompt.trim());
    out.push_str("\n\n");
    out.push_str("If information is missing, fill missing[] and keep plan minimal.\n");
    out.push_str("Do not include markdown or explanations.");
    out
}

/// What the coordinator decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorOutcome {
    pub plan: Vec<PlanStep>,
    /// Normalized missing-information keys; when non-empty the plan is empty
    pub missing: Vec<String>,
}

#[derive(Deserialize)]
struct CoordinatorPayload {
    #[serde(default)]
    plan: Vec<PlanStep>,
    #[serde(default)]
    missing: Vec<String>,
}

pub fn parse_coordinator_reply(reply: &str) -> Result<CoordinatorOutcome> {
    let json_text = extract_json_block(reply);
    if json_text.is_empty() {
        return Err(FlowError::Parse(
            "coordinator response is not json".to_string(),
        ));
    }
    let payload: CoordinatorPayload = serde_json::from_str(&json_text)
        .map_err(|e| FlowError::Parse(format!("coordinator payload: {}", e)))?;

    let missing = normalize_missing(&payload.missing);
    if !missing.is_empty() {
        return Ok(CoordinatorOutcome {
            plan: Vec::new(),
            missing,
        });
    }
    Ok(CoordinatorOutcome {
        plan: normalize_plan_steps(payload.plan),
        missing: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_step_id() {
        assert_eq!(plan_step_id("Install Nginx", 0), "step-1-install-nginx");
        assert_eq!(plan_step_id("  a__b!! ", 2), "step-3-a-b");
        assert_eq!(plan_step_id("安装", 1), "step-2");
    }

    #[test]
    fn test_normalize_drops_nameless() {
        let steps = normalize_plan_steps(vec![
            PlanStep::new("  "),
            PlanStep::new(" install ")
                .with_dependencies(vec![" ".to_string(), " prep ".to_string()]),
        ]);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_name, "install");
        assert_eq!(steps[0].dependencies, vec!["prep".to_string()]);
    }

    #[test]
    fn test_parse_plan() {
        let reply = r#"```json
{"plan":[{"step_name":"install nginx","description":"apt","dependencies":[]}],"missing":[]}
```"#;
        let outcome = parse_coordinator_reply(reply).unwrap();
        assert_eq!(outcome.plan.len(), 1);
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.plan[0].status, StepStatus::Pending);
    }

    #[test]
    fn test_missing_suppresses_plan() {
        let reply = r#"{"plan":[{"step_name":"x"}],"missing":["Targets"," targets "]}"#;
        let outcome = parse_coordinator_reply(reply).unwrap();
        assert!(outcome.plan.is_empty());
        assert_eq!(outcome.missing, vec!["targets".to_string()]);
    }

    #[test]
    fn test_not_json() {
        let err = parse_coordinator_reply("sure, here is a plan").unwrap_err();
        assert!(err.to_string().contains("coordinator response is not json"));
    }

    #[test]
    fn test_fallback_plan() {
        let plan = fallback_plan("install nginx");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].step_name, FALLBACK_STEP_NAME);
        assert_eq!(plan[0].description, "install nginx");
        assert_eq!(plan[0].id, "step-1-generate-workflow-steps");
        assert_eq!(fallback_plan(" ")[0].description, FALLBACK_DESCRIPTION);
    }

    #[test]
    fn test_coordinator_prompt_mentions_request() {
        let prompt = build_coordinator_prompt("install nginx", "os: ubuntu");
        assert!(prompt.contains("User request:\ninstall nginx"));
        assert!(prompt.contains("Context:\nos: ubuntu"));
    }
}
