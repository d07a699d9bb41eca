//! Shell script migration
//!
//! Wraps an existing script in a single `cmd.run` step so it can enter the
//! same review and approval path as generated documents.

use crate::normalizer::apply_defaults;
use flowsmith_core::{FlowError, Result, Step, Workflow};
use serde_json::Value;

pub const MIGRATED_STEP_NAME: &str = "run-script";
const MIGRATED_DESCRIPTION: &str = "migrated from script";

/// Convert a script into a one-step document
pub fn convert_script_to_yaml(script: &str) -> Result<String> {
    let script = script.trim();
    if script.is_empty() {
        return Err(FlowError::InvalidInput("script is empty".to_string()));
    }
    let mut step = Step {
        name: MIGRATED_STEP_NAME.to_string(),
        action: "cmd.run".to_string(),
        ..Default::default()
    };
    step.with
        .insert("cmd".to_string(), Value::String(script.to_string()));

    let mut wf = Workflow {
        description: MIGRATED_DESCRIPTION.to_string(),
        steps: vec![step],
        ..Default::default()
    };
    apply_defaults(&mut wf);
    wf.to_yaml()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_yaml;

    #[test]
    fn test_script_becomes_one_step() {
        let script = "#!/bin/sh\nset -e\necho hello\n";
        let yaml = convert_script_to_yaml(script).unwrap();
        let wf = Workflow::load(&yaml).unwrap();
        assert_eq!(wf.version, "v0.1");
        assert_eq!(wf.description, "migrated from script");
        assert_eq!(wf.plan.mode, "manual-approve");
        assert_eq!(wf.inventory.hosts["local"].address, "127.0.0.1");
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].name, "run-script");
        assert_eq!(wf.steps[0].action, "cmd.run");
        assert_eq!(wf.steps[0].with["cmd"], Value::String(script.trim().to_string()));

        assert!(normalize_yaml(&yaml).is_clean());
    }

    #[test]
    fn test_empty_script_rejected() {
        let err = convert_script_to_yaml(" \n ").unwrap_err();
        assert_eq!(err.to_string(), "script is empty");
    }
}
