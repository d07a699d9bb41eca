//! # flowsmith-orchestrator
//!
//! Orchestration of workflow synthesis.
//!
//! This crate provides:
//! - The [`Pipeline`] state machine: generate or fix, validate, safety gate, execute, summarize
//! - Intent extraction and a question gate that answers vague requests with questions
//! - An autonomous tool-calling loop with budgets, progress detection and durable memory
//! - Multi-agent synthesis (coordinator, coder, reviewer) over a shared [`DraftStore`]
//! - A coordinator loop refining each plan step in a short write/review sub-loop
//! - Per-session and global admission lanes
//! - In-place regeneration of a single step

#![allow(dead_code)]

mod agent_loop;
mod checkpoint;
mod completion;
mod draft_store;
mod graph;
mod lanes;
mod multi_agent;
mod pipeline;
mod prompt;
mod regen;
mod state;
mod subloop;
mod tools;

pub use agent_loop::{progress_fingerprint, termination_for};
pub use checkpoint::CheckpointStore;
pub use completion::{
    evaluate_completion, CompletionEvaluation, CompletionInput, CHECK_COMPLETION_TOKEN,
    CHECK_HAS_STEPS, CHECK_NO_HIGH_RISK, CHECK_PRD_ALL_PASS, CHECK_TESTS_GREEN,
    CHECK_YAML_NON_EMPTY,
};
pub use draft_store::{
    Draft, DraftStore, DEFAULT_DRAFT_ID, METRIC_REVIEWS, METRIC_REVIEW_DURATION_MS,
    METRIC_REVIEW_FAILED, METRIC_REVIEW_RETRIES, METRIC_STEPS_UPDATED,
    METRIC_VALIDATION_DURATION_MS, METRIC_VALIDATION_RETRIES,
};
pub use graph::{Graph, NodeId};
pub use lanes::{GlobalLane, SessionLane};
pub use multi_agent::MultiCheckpoint;
pub use pipeline::Pipeline;
pub use prompt::{build_fix_prompt, build_generate_prompt, build_loop_prompt, LoopPromptInput};
pub use regen::RegenOutcome;
pub use state::{AgentIdentity, LoopProfile, RunError, RunOptions, RunResult, SynthesisState};
pub use subloop::{SubLoopResult, SUBLOOP_MAX_ROUNDS};
pub use tools::{BuiltinTools, TOOL_RISK_SCAN, TOOL_SIMULATE, TOOL_VALIDATE};
