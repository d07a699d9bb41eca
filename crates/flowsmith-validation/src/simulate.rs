//! Dry-run simulation: what a document would do, without running anything

use flowsmith_core::{FlowError, Result, Workflow};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationStep {
    pub index: usize,
    pub name: String,
    pub action: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationResult {
    pub summary: String,
    pub plan_mode: String,
    pub plan_strategy: String,
    pub hosts: Vec<String>,
    pub steps: Vec<SimulationStep>,
}

/// Describe the steps and hosts a document covers
pub fn simulate(text: &str) -> Result<SimulationResult> {
    if text.trim().is_empty() {
        return Err(FlowError::InvalidInput("yaml is required".to_string()));
    }
    let wf = Workflow::load(text)?;
    let hosts = wf.host_names();
    let steps: Vec<SimulationStep> = wf
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| SimulationStep {
            index: i + 1,
            name: step.name.clone(),
            action: step.action.clone(),
            targets: step.targets.clone(),
        })
        .collect();

    Ok(SimulationResult {
        summary: format!(
            "steps={} hosts={} plan={}/{}",
            steps.len(),
            hosts.len(),
            wf.plan.mode,
            wf.plan.strategy
        ),
        plan_mode: wf.plan.mode,
        plan_strategy: wf.plan.strategy,
        hosts,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        let text = r#"
inventory:
  hosts:
    web2: {address: 10.0.0.2}
    web1: {address: 10.0.0.1}
  groups:
    web:
      hosts: [web1, web3]
plan: {mode: auto, strategy: sequential}
steps:
  - name: a
    action: cmd.run
    with: {cmd: 'true'}
  - name: b
    action: env.set
    with: {FOO: bar}
"#;
        let sim = simulate(text).unwrap();
        assert_eq!(sim.summary, "steps=2 hosts=3 plan=auto/sequential");
        assert_eq!(sim.hosts, vec!["web1", "web2", "web3"]);
        assert_eq!(sim.steps[1].index, 2);
        assert_eq!(sim.steps[1].action, "env.set");
    }

    #[test]
    fn test_empty_is_error() {
        assert!(simulate("").is_err());
        assert!(simulate("[not a map").is_err());
    }
}
