//! Document normalization
//!
//! [`Normalizer::normalize`] fills defaults, drops generator-supplied host
//! targeting, runs the quality pass, scans for risk and collects every
//! structural and guardrail issue. Malformed input is handed back untouched
//! together with the parse error as an issue.

use crate::guardrails::guardrail_issues;
use crate::quality::apply_quality_pass;
use crate::risk::{RiskAssessment, RiskEvaluator};
use flowsmith_core::{
    dedupe_strings, FlowError, Host, Result, RiskLevel, Step, Workflow, DEFAULT_PLAN_MODE, DEFAULT_PLAN_STRATEGY,
    DEFAULT_WORKFLOW_NAME, DEFAULT_WORKFLOW_VERSION,
};
use serde::Serialize;
use tracing::debug;

const LOCAL_HOST: &str = "local";
const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Result of one normalization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    /// Normalized text, or the input unchanged when it could not be parsed
    pub yaml: String,
    /// Structural and guardrail issues, empty when the document is final-ready
    pub issues: Vec<String>,
    /// Rewrites applied on the caller's behalf
    pub notices: Vec<String>,
    pub risk: RiskAssessment,
}

impl NormalizeOutcome {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Applies defaults, guardrails, quality and risk rules in a fixed order
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    risk: RiskEvaluator,
}

impl Normalizer {
    pub fn new(risk: RiskEvaluator) -> Self {
        Self { risk }
    }

    pub fn risk_evaluator(&self) -> &RiskEvaluator {
        &self.risk
    }

    /// Normalize document text
    pub fn normalize(&self, text: &str) -> NormalizeOutcome {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return NormalizeOutcome {
                yaml: String::new(),
                issues: vec!["yaml is empty".to_string()],
                ..Default::default()
            };
        }

        let mut wf = match Workflow::load(trimmed) {
            Ok(wf) => wf,
            Err(e) => {
                debug!("normalize: keeping unparsable input: {}", e);
                return NormalizeOutcome {
                    yaml: text.to_string(),
                    issues: vec![format!("yaml parse error: {}", e)],
                    notices: Vec::new(),
                    risk: self.risk.evaluate(text),
                };
            }
        };

        let mut notices = Vec::new();
        if apply_defaults(&mut wf) {
            notices.push("removed step targets from generated output".to_string());
        }
        notices.extend(apply_quality_pass(&mut wf).notices);

        let mut yaml = match wf.to_yaml() {
            Ok(yaml) => yaml,
            Err(e) => {
                return NormalizeOutcome {
                    yaml: text.to_string(),
                    issues: vec![format!("yaml serialize error: {}", e)],
                    notices,
                    risk: self.risk.evaluate(text),
                }
            }
        };

        let risk = self.risk.evaluate(&yaml);
        if risk.level == RiskLevel::High && force_manual_approve(&mut wf) {
            notices.push("plan mode forced to manual-approve due to high risk".to_string());
            if let Ok(text) = wf.to_yaml() {
                yaml = text;
            }
        }

        let mut issues = wf.validate();
        issues.extend(guardrail_issues(&wf, &yaml));

        NormalizeOutcome {
            yaml,
            issues: dedupe_strings(issues),
            notices,
            risk,
        }
    }
}

/// Normalize with the built-in risk rules
pub fn normalize_yaml(text: &str) -> NormalizeOutcome {
    Normalizer::default().normalize(text)
}

/// Fill header, inventory and plan defaults and clear step targeting
///
/// Returns true when any step carried targets.
pub fn apply_defaults(wf: &mut Workflow) -> bool {
    if wf.version.trim().is_empty() {
        wf.version = DEFAULT_WORKFLOW_VERSION.to_string();
    }
    if wf.name.trim().is_empty() {
        wf.name = DEFAULT_WORKFLOW_NAME.to_string();
    }
    if wf.inventory.is_empty() {
        wf.inventory.hosts.insert(
            LOCAL_HOST.to_string(),
            Host {
                address: LOCAL_ADDRESS.to_string(),
                vars: Default::default(),
            },
        );
    }
    if wf.plan.mode.trim().is_empty() {
        wf.plan.mode = DEFAULT_PLAN_MODE.to_string();
    }
    if wf.plan.strategy.trim().is_empty() {
        wf.plan.strategy = DEFAULT_PLAN_STRATEGY.to_string();
    }

    let mut cleared = false;
    for step in wf.steps.iter_mut() {
        if !step.targets.is_empty() {
            step.targets.clear();
            cleared = true;
        }
    }
    cleared
}

/// Force `manual-approve`; returns true when the mode changed
pub fn force_manual_approve(wf: &mut Workflow) -> bool {
    if wf.plan.mode == DEFAULT_PLAN_MODE {
        return false;
    }
    wf.plan.mode = DEFAULT_PLAN_MODE.to_string();
    true
}

/// Replace the steps of `base` with the steps of `generated`
///
/// Everything else in the base document is preserved. When either side
/// does not parse the generated text is returned as-is.
pub fn merge_steps_into_base(base: &str, generated: &str) -> String {
    if base.trim().is_empty() {
        return generated.to_string();
    }
    let (mut base_wf, generated_wf) = match (Workflow::load(base), Workflow::load(generated)) {
        (Ok(b), Ok(g)) => (b, g),
        _ => return generated.to_string(),
    };
    base_wf.steps = generated_wf.steps;
    base_wf
        .to_yaml()
        .unwrap_or_else(|_| generated.to_string())
}

/// Parse a bare YAML list of steps
pub fn parse_step_fragment(fragment: &str) -> Result<Vec<Step>> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return Err(FlowError::Parse("fragment is empty".to_string()));
    }
    let steps: Vec<Step> = serde_yaml::from_str(trimmed)?;
    if steps.is_empty() {
        return Err(FlowError::Parse("no steps in fragment".to_string()));
    }
    Ok(steps)
}

/// Merge fragment steps into `base` by name
///
/// A step whose name matches an existing one replaces it in place; the
/// rest are appended. Nameless steps are ignored. An empty base starts from
/// a default document.
pub fn merge_fragment_into_steps(base: &str, fragment: &str) -> Result<String> {
    let mut wf = if base.trim().is_empty() {
        Workflow::default()
    } else {
        Workflow::load(base.trim())?
    };
    for next in parse_step_fragment(fragment)? {
        let name = next.name.trim();
        if name.is_empty() {
            continue;
        }
        match wf.steps.iter_mut().find(|s| s.name.trim() == name) {
            Some(existing) => *existing = next,
            None => wf.steps.push(next),
        }
    }
    apply_defaults(&mut wf);
    wf.to_yaml()
}

#[derive(Serialize)]
struct StepsOnly<'a> {
    steps: &'a [Step],
}

/// Serialize only the `steps` key, or an empty string when there are none
pub fn steps_only_yaml(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let wf = match Workflow::load(text) {
        Ok(wf) => wf,
        Err(_) => return String::new(),
    };
    if wf.steps.is_empty() {
        return String::new();
    }
    serde_yaml::to_string(&StepsOnly { steps: &wf.steps })
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
