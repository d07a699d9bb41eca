//! # flowsmith-core
//!
//! Core types for the flowsmith workflow synthesis engine.
//!
//! flowsmith turns a natural-language operations request into a declarative
//! workflow document and keeps refining it until it is safe and valid.
//!
//! This crate provides:
//! - The unified error type shared by every other crate
//! - Shared enums (synthesis mode, risk level, step status)
//! - Progress events and the caller-supplied event sink
//! - The workflow document model (load, serialize, structural validation)
//! - Repository-level configuration loaded from `.flowsmith/config.toml`
//! - Fail-open helpers for non-critical infrastructure work

#![allow(dead_code)]

mod config;
mod error;
mod event;
pub mod fail_open;
mod text;
mod types;
mod workflow;

pub use config::{
    ChatConfig, FlowConfig, LanesConfig, LoopDefaults, MemoryConfig, MultiAgentConfig,
    PipelineConfig, RunnerConfig,
};
pub use error::{FlowError, Result};
pub use event::{Event, EventSink};
pub use text::{dedupe_strings, merge_questions, normalize_questions, tail_strings, truncate_chars};
pub use types::*;
pub use workflow::{
    count_steps, Group, Handler, Host, Inventory, Plan, Step, Workflow, DEFAULT_PLAN_MODE,
    DEFAULT_PLAN_STRATEGY, DEFAULT_WORKFLOW_NAME, DEFAULT_WORKFLOW_VERSION,
};
