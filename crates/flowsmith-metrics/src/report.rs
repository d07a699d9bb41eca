//! Effectiveness reports: baseline vs. treatment telemetry

use flowsmith_core::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::loop_metrics::{LoopMetrics, TerminationReason};

const UNKNOWN_CLASS: &str = "unknown";

/// One loop session as seen by reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTelemetry {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode_profile: String,
    #[serde(default)]
    pub terminal_reason: TerminationReason,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub false_complete: bool,
    #[serde(default)]
    pub handoff: bool,
    #[serde(default)]
    pub iterations: usize,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub tool_calls: usize,
}

impl SessionTelemetry {
    /// Telemetry entry for a finished loop
    pub fn from_loop_metrics(metrics: &LoopMetrics, task_class: &str) -> Self {
        Self {
            session_id: metrics.session_id.clone(),
            task_class: normalize_task_class(task_class),
            mode_profile: metrics.mode_profile.trim().to_string(),
            terminal_reason: metrics.terminal,
            completed: metrics.is_completed(),
            false_complete: false,
            handoff: false,
            iterations: metrics.iterations,
            latency_ms: metrics.duration_ms,
            tool_calls: metrics.tool_calls,
        }
    }
}

/// Thresholds a treatment must meet to ship
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseGate {
    #[serde(default)]
    pub min_completion_rate_delta: f64,
    #[serde(default)]
    pub max_false_complete_rate: f64,
    /// Relative increase of mean tool calls over baseline
    #[serde(default)]
    pub max_tool_call_increase: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportInput {
    pub baseline_window: String,
    pub treatment_window: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cohort: String,
    #[serde(default)]
    pub baseline: Vec<SessionTelemetry>,
    #[serde(default)]
    pub treatment: Vec<SessionTelemetry>,
    #[serde(default)]
    pub release_gate: ReleaseGate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub samples: usize,
    pub completion_rate: f64,
    pub false_complete_rate: f64,
    pub handoff_rate: f64,
    pub median_iterations: f64,
    pub p95_iterations: f64,
    pub average_latency_ms: f64,
    pub average_tool_calls: f64,
}

impl MetricSummary {
    fn from_items(items: &[&SessionTelemetry]) -> Self {
        if items.is_empty() {
            return Self::default();
        }
        let n = items.len();
        let count = |f: fn(&SessionTelemetry) -> bool| items.iter().filter(|i| f(i)).count();
        let iterations: Vec<usize> = items.iter().map(|i| i.iterations).collect();
        let latency: u64 = items.iter().map(|i| i.latency_ms).sum();
        let tool_calls: usize = items.iter().map(|i| i.tool_calls).sum();

        Self {
            samples: n,
            completion_rate: ratio(count(|i| i.completed), n),
            false_complete_rate: ratio(count(|i| i.false_complete), n),
            handoff_rate: ratio(count(|i| i.handoff), n),
            median_iterations: percentile(&iterations, 50),
            p95_iterations: percentile(&iterations, 95),
            average_latency_ms: latency as f64 / n as f64,
            average_tool_calls: tool_calls as f64 / n as f64,
        }
    }

    /// Treatment figures, with the three rates expressed as deltas over baseline
    fn delta(baseline: &Self, treatment: &Self) -> Self {
        Self {
            samples: treatment.samples,
            completion_rate: treatment.completion_rate - baseline.completion_rate,
            false_complete_rate: treatment.false_complete_rate - baseline.false_complete_rate,
            handoff_rate: treatment.handoff_rate - baseline.handoff_rate,
            ..treatment.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonBreakdown {
    pub samples: usize,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub pass: bool,
    pub value: f64,
    pub target: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDecision {
    pub pass: bool,
    pub criteria: Vec<GateResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessReport {
    pub baseline_window: String,
    pub treatment_window: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cohort: String,
    pub baseline: MetricSummary,
    pub treatment: MetricSummary,
    /// Treatment vs. baseline
    pub summary: MetricSummary,
    pub per_class: BTreeMap<String, MetricSummary>,
    /// Treatment sessions grouped by how they ended
    pub termination: BTreeMap<String, ReasonBreakdown>,
    pub release_decision: ReleaseDecision,
}

pub fn generate_report(input: &ReportInput) -> Result<EffectivenessReport> {
    if input.baseline.is_empty() {
        return Err(FlowError::Report("baseline data is required".to_string()));
    }
    if input.treatment.is_empty() {
        return Err(FlowError::Report("treatment data is required".to_string()));
    }
    if input.baseline_window.trim().is_empty() || input.treatment_window.trim().is_empty() {
        return Err(FlowError::Report(
            "baseline/treatment windows are required".to_string(),
        ));
    }

    let baseline = MetricSummary::from_items(&input.baseline.iter().collect::<Vec<_>>());
    let treatment = MetricSummary::from_items(&input.treatment.iter().collect::<Vec<_>>());
    let release_decision = evaluate_gate(&input.release_gate, &baseline, &treatment);

    Ok(EffectivenessReport {
        baseline_window: input.baseline_window.clone(),
        treatment_window: input.treatment_window.clone(),
        cohort: input.cohort.trim().to_string(),
        summary: MetricSummary::delta(&baseline, &treatment),
        per_class: summarize_by_class(&input.baseline, &input.treatment),
        termination: summarize_by_termination(&input.treatment),
        baseline,
        treatment,
        release_decision,
    })
}

fn summarize_by_class(
    baseline: &[SessionTelemetry],
    treatment: &[SessionTelemetry],
) -> BTreeMap<String, MetricSummary> {
    let classes: BTreeSet<String> = baseline
        .iter()
        .chain(treatment.iter())
        .map(|i| normalize_task_class(&i.task_class))
        .collect();

    let mut result = BTreeMap::new();
    for class in classes {
        let treatment_items = filter_by_class(treatment, &class);
        if treatment_items.is_empty() {
            continue;
        }
        let base = MetricSummary::from_items(&filter_by_class(baseline, &class));
        let treat = MetricSummary::from_items(&treatment_items);
        result.insert(class.clone(), MetricSummary::delta(&base, &treat));
    }
    result
}

fn filter_by_class<'a>(items: &'a [SessionTelemetry], class: &str) -> Vec<&'a SessionTelemetry> {
    items
        .iter()
        .filter(|i| normalize_task_class(&i.task_class) == class)
        .collect()
}

fn summarize_by_termination(items: &[SessionTelemetry]) -> BTreeMap<String, ReasonBreakdown> {
    let mut grouped: BTreeMap<String, Vec<&SessionTelemetry>> = BTreeMap::new();
    for item in items {
        grouped
            .entry(item.terminal_reason.to_string())
            .or_default()
            .push(item);
    }
    grouped
        .into_iter()
        .map(|(reason, part)| {
            let summary = MetricSummary::from_items(&part);
            (
                reason,
                ReasonBreakdown {
                    samples: summary.samples,
                    completion_rate: summary.completion_rate,
                },
            )
        })
        .collect()
}

fn evaluate_gate(
    gate: &ReleaseGate,
    baseline: &MetricSummary,
    treatment: &MetricSummary,
) -> ReleaseDecision {
    let completion_delta = treatment.completion_rate - baseline.completion_rate;
    let tool_call_increase = if baseline.average_tool_calls > 0.0 {
        (treatment.average_tool_calls - baseline.average_tool_calls) / baseline.average_tool_calls
    } else {
        0.0
    };

    let criteria = vec![
        GateResult {
            name: "completion_rate_delta".to_string(),
            pass: completion_delta >= gate.min_completion_rate_delta,
            value: completion_delta,
            target: gate.min_completion_rate_delta,
        },
        GateResult {
            name: "false_complete_rate".to_string(),
            pass: treatment.false_complete_rate <= gate.max_false_complete_rate,
            value: treatment.false_complete_rate,
            target: gate.max_false_complete_rate,
        },
        GateResult {
            name: "tool_call_increase".to_string(),
            pass: tool_call_increase <= gate.max_tool_call_increase,
            value: tool_call_increase,
            target: gate.max_tool_call_increase,
        },
    ];

    ReleaseDecision {
        pass: criteria.iter().all(|c| c.pass),
        criteria,
    }
}

fn normalize_task_class(class: &str) -> String {
    match class.trim().to_lowercase() {
        c if c.is_empty() => UNKNOWN_CLASS.to_string(),
        c => c,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

/// Nearest-rank percentile with rank `floor(p/100 * (n-1))`
fn percentile(values: &[usize], p: u32) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let p = p.min(100) as f64;
    let rank = (p / 100.0 * (sorted.len() - 1) as f64) as usize;
    sorted[rank] as f64
}
