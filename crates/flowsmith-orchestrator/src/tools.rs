//! Tools offered to the autonomous loop when the caller brings none

use async_trait::async_trait;
use flowsmith_agent::ToolExecutor;
use flowsmith_core::{FlowError, Result};
use flowsmith_validation::{simulate, Normalizer};
use serde_json::{json, Value};
use tracing::debug;

pub const TOOL_VALIDATE: &str = "validate_workflow";
pub const TOOL_RISK_SCAN: &str = "risk_scan";
pub const TOOL_SIMULATE: &str = "simulate_workflow";

/// Validation, risk and dry-run tools over `args.yaml`
///
/// Every output is a JSON object with a `status` of `ok` or `failed`, so
/// the loop's tool history carries a plain pass/fail signal.
#[derive(Debug, Clone, Default)]
pub struct BuiltinTools {
    normalizer: Normalizer,
}

impl BuiltinTools {
    pub fn new(normalizer: Normalizer) -> Self {
        Self { normalizer }
    }

    fn validate(&self, yaml: &str) -> Value {
        let outcome = self.normalizer.normalize(yaml);
        json!({
            "status": if outcome.issues.is_empty() { "ok" } else { "failed" },
            "issues": outcome.issues,
            "notices": outcome.notices,
            "risk": outcome.risk.level,
        })
    }

    fn risk_scan(&self, yaml: &str) -> Value {
        let risk = self.normalizer.risk_evaluator().evaluate(yaml);
        json!({
            "status": "ok",
            "level": risk.level,
            "notes": risk.notes,
        })
    }

    fn simulate(&self, yaml: &str) -> Result<Value> {
        let result = simulate(yaml)?;
        let mut value = serde_json::to_value(result)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("status".to_string(), json!("ok"));
        }
        Ok(value)
    }
}

fn yaml_arg(tool: &str, args: &Value) -> Result<String> {
    match args.get("yaml").and_then(Value::as_str).map(str::trim) {
        Some(yaml) if !yaml.is_empty() => Ok(yaml.to_string()),
        _ => Err(FlowError::Tool(format!("{}: args.yaml is required", tool))),
    }
}

#[async_trait]
impl ToolExecutor for BuiltinTools {
    async fn execute(&self, tool: &str, args: &Value) -> Result<String> {
        debug!("builtin tool {}", tool);
        let output = match tool.trim() {
            TOOL_VALIDATE => self.validate(&yaml_arg(tool, args)?),
            TOOL_RISK_SCAN => self.risk_scan(&yaml_arg(tool, args)?),
            TOOL_SIMULATE => self.simulate(&yaml_arg(tool, args)?)?,
            other => return Err(FlowError::Tool(format!("unknown tool: {}", other))),
        };
        Ok(serde_json::to_string(&output)?)
    }

    fn tool_names(&self) -> Vec<String> {
        vec![
            TOOL_VALIDATE.to_string(),
            TOOL_RISK_SCAN.to_string(),
            TOOL_SIMULATE.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "version: v0.1\nname: web\ninventory:\n  hosts:\n    web1:\n      address: 10.0.0.1\nplan:\n  mode: auto\n  strategy: sequential\nsteps:\n- name: open perms\n  action: cmd.run\n  with:\n    cmd: chmod 777 /srv/app\n";

    #[tokio::test]
    async fn test_validate_tool() {
        let tools = BuiltinTools::default();
        let out = tools
            .execute(TOOL_VALIDATE, &json!({ "yaml": DOC }))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["risk"], "medium");

        let out = tools
            .execute(TOOL_VALIDATE, &json!({ "yaml": "version: v0.1\nname: x\nsteps: []" }))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["status"], "failed");
        assert!(!value["issues"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_and_simulate_tools() {
        let tools = BuiltinTools::default();
        let risk: Value = serde_json::from_str(
            &tools.execute(TOOL_RISK_SCAN, &json!({ "yaml": DOC })).await.unwrap(),
        )
        .unwrap();
        assert_eq!(risk["notes"][0], "chmod 777");

        let sim: Value = serde_json::from_str(
            &tools.execute(TOOL_SIMULATE, &json!({ "yaml": DOC })).await.unwrap(),
        )
        .unwrap();
        assert_eq!(sim["summary"], "steps=1 hosts=1 plan=auto/sequential");
        assert_eq!(sim["status"], "ok");
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let tools = BuiltinTools::default();
        let err = tools.execute(TOOL_VALIDATE, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("args.yaml is required"));
        assert!(matches!(
            tools.execute("deploy", &json!({ "yaml": DOC })).await,
            Err(FlowError::Tool(_))
        ));
        assert_eq!(tools.tool_names().len(), 3);
    }
}
