//! # flowsmith-agent
//!
//! Seams between the synthesis engine and the outside world.
//!
//! This crate provides:
//! - [`ChatClient`]: the chat-completion backend, with an OpenAI-compatible
//!   HTTP implementation guarded by a [`CircuitBreaker`] and a scripted mock
//! - [`ValidationRunner`]: the external execution backend, with a command
//!   runner and a mock
//! - [`ToolExecutor`]: named tools the autonomous loop may call
//! - Reply extraction (fenced blocks, bare JSON, YAML) and [`LoopAction`] parsing
//!
//! Every model reply is untrusted text; nothing here assumes the backend
//! followed the requested output format.

#![allow(dead_code)]

mod action;
mod circuit_breaker;
mod client;
mod extract;
mod runner;
mod tools;

pub use action::{parse_loop_action, LoopAction};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{ChatClient, ChatMessage, ChatReply, HttpChatClient, MockChatClient};
pub use extract::{
    extract_code_block, extract_json_block, extract_workflow_yaml, extract_yaml, ExtractedWorkflow,
};
pub use runner::{CommandRunner, MockRunner, ValidationRunner};
pub use tools::{MockToolExecutor, ToolExecutor};
