//! # flowsmith-validation
//!
//! Guardrail, risk and quality normalization for workflow documents.
//!
//! This crate provides:
//! - The action allow-list and structural guardrails every final document must pass
//! - Regex risk rules where allow-rules pre-empt broader deny-rules on the same line
//! - A quality pass (step ceiling, step names, deep parameter trees, adjacent duplicates)
//! - [`Normalizer`], which applies all of the above and never discards malformed input
//! - Merging generated steps into a caller-supplied base document
//! - Dry-run simulation of a document
//! - Merging per-step fragments by name and wrapping shell scripts as documents

#![allow(dead_code)]

mod guardrails;
mod migrate;
mod normalizer;
mod quality;
mod risk;
mod simulate;

pub use guardrails::{
    allowed_action_text, guardrail_issues, is_allowed_action, ALLOWED_ACTIONS, MAX_STEP_COUNT,
};
pub use migrate::{convert_script_to_yaml, MIGRATED_STEP_NAME};
pub use normalizer::{
    apply_defaults, force_manual_approve, merge_fragment_into_steps, merge_steps_into_base,
    normalize_yaml, parse_step_fragment, steps_only_yaml, NormalizeOutcome, Normalizer,
};
pub use quality::{apply_quality_pass, QualityOutcome, MAX_PARAM_DEPTH};
pub use risk::{default_risk_rules, RiskAssessment, RiskEvaluator, RiskRule};
pub use simulate::{simulate, SimulationResult, SimulationStep};
