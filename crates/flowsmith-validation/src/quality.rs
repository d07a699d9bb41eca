//! Quality pass over a parsed document
//!
//! Every rewrite here is reported as a human-readable notice so callers can
//! show what was changed on their behalf.

use crate::guardrails::MAX_STEP_COUNT;
use flowsmith_core::{Step, Workflow};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter trees deeper than this are collapsed to a JSON string
pub const MAX_PARAM_DEPTH: usize = 3;

/// Notices produced by [`apply_quality_pass`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityOutcome {
    pub notices: Vec<String>,
}

impl QualityOutcome {
    pub fn changed(&self) -> bool {
        !self.notices.is_empty()
    }
}

/// Cap steps, name nameless steps, flatten deep parameters, merge adjacent duplicates
pub fn apply_quality_pass(wf: &mut Workflow) -> QualityOutcome {
    let mut notices = Vec::new();

    if wf.steps.len() > MAX_STEP_COUNT {
        wf.steps.truncate(MAX_STEP_COUNT);
        notices.push(format!("steps truncated to {}", MAX_STEP_COUNT));
    }

    let mut named = false;
    for (i, step) in wf.steps.iter_mut().enumerate() {
        if step.name.trim().is_empty() {
            step.name = if step.action.trim().is_empty() {
                format!("step-{}", i + 1)
            } else {
                step.action.trim().to_string()
            };
            named = true;
        }
    }
    if named {
        notices.push("filled missing step names".to_string());
    }

    let mut flattened = false;
    for step in wf.steps.iter_mut() {
        let (with, changed) = simplify_map(std::mem::take(&mut step.with), 1);
        step.with = with;
        flattened |= changed;
    }
    if flattened {
        notices.push("simplified deeply nested parameters".to_string());
    }

    let before = wf.steps.len();
    wf.steps = dedupe_adjacent(std::mem::take(&mut wf.steps));
    if wf.steps.len() != before {
        notices.push("merged duplicate adjacent steps".to_string());
    }

    QualityOutcome { notices }
}

fn simplify_map(input: BTreeMap<String, Value>, depth: usize) -> (BTreeMap<String, Value>, bool) {
    let mut changed = false;
    let out = input
        .into_iter()
        .map(|(k, v)| {
            let (v, c) = simplify_value(v, depth);
            changed |= c;
            (k, v)
        })
        .collect();
    (out, changed)
}

fn simplify_value(value: Value, depth: usize) -> (Value, bool) {
    if depth >= MAX_PARAM_DEPTH {
        return match value {
            Value::Object(_) | Value::Array(_) => match serde_json::to_string(&value) {
                Ok(text) => (Value::String(text), true),
                Err(_) => (value, false),
            },
            other => (other, false),
        };
    }
    match value {
        Value::Object(map) => {
            let mut changed = false;
            let out = map
                .into_iter()
                .map(|(k, v)| {
                    let (v, c) = simplify_value(v, depth + 1);
                    changed |= c;
                    (k, v)
                })
                .collect();
            (Value::Object(out), changed)
        }
        Value::Array(items) => {
            let mut changed = false;
            let out = items
                .into_iter()
                .map(|v| {
                    let (v, c) = simplify_value(v, depth + 1);
                    changed |= c;
                    v
                })
                .collect();
            (Value::Array(out), changed)
        }
        other => (other, false),
    }
}

fn dedupe_adjacent(steps: Vec<Step>) -> Vec<Step> {
    let mut out: Vec<Step> = Vec::with_capacity(steps.len());
    let mut previous: Option<String> = None;
    for step in steps {
        let signature = step_signature(&step);
        if previous.as_deref() == Some(signature.as_str()) {
            continue;
        }
        previous = Some(signature);
        out.push(step);
    }
    out
}

/// Field-order independent identity of a step
fn step_signature(step: &Step) -> String {
    let with = serde_json::to_string(&step.with).unwrap_or_default();
    let loop_items = serde_json::to_string(&step.loop_items).unwrap_or_default();
    [
        step.name.trim().to_string(),
        step.action.trim().to_string(),
        step.when.trim().to_string(),
        step.timeout.clone(),
        step.retries.to_string(),
        step.targets.join(","),
        step.notify.join(","),
        with,
        loop_items,
    ]
    .join("|")
}
