//! # flowsmith-planning
//!
//! Decomposition artifacts for multi-agent synthesis.
//!
//! This crate provides:
//! - [`PlanStep`] and the coordinator prompt / payload parsing
//! - [`StepPatch`] and the coder / reviewer prompts, parsing and plan alignment
//! - Follow-up questions built from the coordinator's `missing` list
//! - The [`Requirements`] record kept in loop memory
//! - Single-step regeneration prompts and reply parsing
//! - [`Intent`] extraction and greeting detection for single-pass runs
//! - Per-step sub-plan prompts, fragment checks and review parsing

#![allow(dead_code)]

mod intent;
mod patch;
mod plan;
mod questions;
mod regen;
mod requirements;
mod subplan;

pub use intent::{
    build_intent_prompt, is_greeting_prompt, parse_intent_reply, Intent, GREETING_MISSING_KEY,
    INTENT_SYSTEM_PROMPT,
};
pub use patch::{
    align_step_patch, build_coder_prompt, build_reviewer_prompt, parse_step_patch,
    validate_step_patch, PatchSource, ReviewResult, StepPatch,
};
pub use plan::{
    assign_plan_ids, build_coordinator_prompt, fallback_plan, normalize_plan_steps,
    parse_coordinator_reply, plan_step_id, CoordinatorOutcome, PlanStep, FALLBACK_STEP_NAME,
};
pub use questions::{normalize_missing, question_for, questions_from_missing, should_ask_questions};
pub use regen::{
    build_regen_prompt, normalize_regen_step, parse_regen_reply, NeighborStep, RegenNode,
    RegenResult,
};
pub use requirements::{Requirements, UserStory};
pub use subplan::{
    build_fragment_review_prompt, build_subloop_prompt, parse_review_issues, parse_subloop_reply,
    validate_sub_plan, SUBLOOP_REVIEW_SYSTEM_PROMPT, SUBLOOP_SYSTEM_PROMPT,
};
