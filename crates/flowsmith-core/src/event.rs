//! Progress events emitted while a document is being synthesized
//!
//! Events are purely observational: the returned state is authoritative and
//! no component reads events back.

use crate::EventStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A structured progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Node or event name (`generator`, `review_done`, a tool name, ...)
    pub node: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub loop_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_step_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(node: impl Into<String>, status: EventStatus) -> Self {
        let node = node.into();
        Self {
            call_id: node.clone(),
            display_name: node.clone(),
            node,
            status,
            message: String::new(),
            event_type: String::new(),
            agent_id: String::new(),
            agent_name: String::new(),
            agent_role: String::new(),
            agent_status: String::new(),
            loop_id: String::new(),
            iteration: None,
            parent_step_id: String::new(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_agent(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        self.agent_id = id.into();
        self.agent_name = name.into();
        self.agent_role = role.into();
        self
    }

    pub fn with_loop(mut self, loop_id: impl Into<String>, iteration: usize) -> Self {
        self.loop_id = loop_id.into();
        self.iteration = Some(iteration);
        self
    }

    pub fn with_agent_status(mut self, status: impl Into<String>) -> Self {
        self.agent_status = status.into();
        self
    }

    pub fn with_parent_step(mut self, step_id: impl Into<String>) -> Self {
        self.parent_step_id = step_id.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Caller-supplied callback receiving progress events
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;
