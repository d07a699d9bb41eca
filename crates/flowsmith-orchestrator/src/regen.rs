//! Regenerate one step of an existing document in place

use flowsmith_core::{FlowError, Result, Step, Workflow};
use flowsmith_planning::{
    build_regen_prompt, normalize_regen_step, parse_regen_reply, NeighborStep, RegenNode,
};
use tracing::{info, instrument};

use crate::pipeline::Pipeline;
use crate::state::RunOptions;

/// How many neighbours on each side are shown to the model
const NEIGHBOR_WINDOW: usize = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegenOutcome {
    pub step: Step,
    pub questions: Vec<String>,
    /// The whole document with the step replaced, normalized
    pub yaml: String,
    pub issues: Vec<String>,
}

fn neighbors(steps: &[Step]) -> Vec<NeighborStep> {
    steps
        .iter()
        .map(|s| NeighborStep {
            name: s.name.clone(),
            action: s.action.clone(),
        })
        .collect()
}

impl Pipeline {
    /// Ask the model for a better version of `steps[index]`
    ///
    /// The step keeps its original targets. A reply with an unusable name or
    /// action is rejected without touching the document.
    #[instrument(skip(self, yaml, intent, opts))]
    pub async fn regenerate_step(
        &self,
        yaml: &str,
        index: usize,
        intent: &str,
        opts: &RunOptions,
    ) -> Result<RegenOutcome> {
        let mut wf = Workflow::load(yaml)?;
        let Some(current) = wf.steps.get(index).cloned() else {
            return Err(FlowError::InvalidInput(format!(
                "step index {} out of range ({} steps)",
                index,
                wf.steps.len()
            )));
        };

        let node = RegenNode {
            id: format!("step-{}", index + 1),
            index,
            name: current.name.clone(),
            action: current.action.clone(),
            with: current.with.clone(),
            targets: current.targets.clone(),
        };
        let previous = neighbors(&wf.steps[index.saturating_sub(NEIGHBOR_WINDOW)..index]);
        let end = (index + 1 + NEIGHBOR_WINDOW).min(wf.steps.len());
        let next = neighbors(&wf.steps[index + 1..end]);

        let system_prompt = opts
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.config().pipeline.system_prompt.clone());
        let prompt = build_regen_prompt(intent, &node, &previous, &next, yaml);
        let reply = self
            .global_lane()
            .run(&opts.cancel, || self.chat(opts, &system_prompt, prompt))
            .await?;

        let parsed = parse_regen_reply(&reply.content)?;
        let (mut step, issues) = normalize_regen_step(parsed.step);
        if !issues.is_empty() {
            return Err(FlowError::ValidationFailed(issues.join("; ")));
        }
        step.targets = current.targets;

        wf.steps[index] = step.clone();
        let outcome = self.normalizer().normalize(&wf.to_yaml()?);
        info!("regenerated step {} ({})", index, step.name);
        Ok(RegenOutcome {
            step,
            questions: parsed.questions,
            yaml: outcome.yaml,
            issues: outcome.issues,
        })
    }
}
