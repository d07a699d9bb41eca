//! The synthesis graph: named nodes and the edges between them
//!
//! Edges are data. A branch edge is a pure function of the run state that
//! names the next node, so the whole control flow can be checked once at
//! compile time and tested without any backend.

use flowsmith_core::{FlowError, Mode, Result};
use std::collections::HashMap;

use crate::state::SynthesisState;

/// Nodes of the synthesis graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Normalize,
    IntentExtract,
    QuestionGate,
    Generate,
    Validate,
    Safety,
    Execute,
    Fix,
    Summarize,
    HumanGate,
    End,
}

impl NodeId {
    pub const ALL: [NodeId; 11] = [
        NodeId::Normalize,
        NodeId::IntentExtract,
        NodeId::QuestionGate,
        NodeId::Generate,
        NodeId::Validate,
        NodeId::Safety,
        NodeId::Execute,
        NodeId::Fix,
        NodeId::Summarize,
        NodeId::HumanGate,
        NodeId::End,
    ];

    /// Event node name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::IntentExtract => "intent_extract",
            Self::QuestionGate => "question_gate",
            Self::Generate => "generator",
            Self::Validate => "validator",
            Self::Safety => "safety",
            Self::Execute => "executor",
            Self::Fix => "fixer",
            Self::Summarize => "summarizer",
            Self::HumanGate => "human_gate",
            Self::End => "end",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Normalize => "Normalize input",
            Self::IntentExtract => "Extract intent",
            Self::QuestionGate => "Clarifying questions",
            Self::Generate => "Generate workflow",
            Self::Validate => "Validate workflow",
            Self::Safety => "Safety check",
            Self::Execute => "Execution check",
            Self::Fix => "Fix workflow",
            Self::Summarize => "Summarize result",
            Self::HumanGate => "Human review",
            Self::End => "End",
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Branch = fn(&SynthesisState) -> NodeId;

#[derive(Clone, Copy)]
enum Edge {
    To(NodeId),
    Branch(Branch),
}

fn after_normalize(state: &SynthesisState) -> NodeId {
    match state.mode {
        Mode::Generate => NodeId::IntentExtract,
        Mode::Fix => NodeId::Fix,
    }
}

fn after_question_gate(state: &SynthesisState) -> NodeId {
    if state.questions.is_empty() {
        NodeId::Generate
    } else {
        NodeId::Summarize
    }
}

fn after_validate(state: &SynthesisState) -> NodeId {
    if state.issues.is_empty() {
        NodeId::Safety
    } else if state.retry_count < state.max_retries {
        NodeId::Fix
    } else {
        NodeId::Summarize
    }
}

fn after_safety(state: &SynthesisState) -> NodeId {
    if state.execution_skipped {
        NodeId::Summarize
    } else {
        NodeId::Execute
    }
}

fn after_execute(state: &SynthesisState) -> NodeId {
    if state.execution_skipped || state.is_success || state.retry_count >= state.max_retries {
        NodeId::Summarize
    } else {
        NodeId::Fix
    }
}

/// Compiled graph; build once, run many times
pub struct Graph {
    edges: HashMap<NodeId, Edge>,
}

impl Graph {
    /// Most transitions a single run may take
    pub const MAX_TRANSITIONS: usize = 64;

    pub fn compile() -> Result<Self> {
        let edges = HashMap::from([
            (NodeId::Normalize, Edge::Branch(after_normalize as Branch)),
            (NodeId::IntentExtract, Edge::To(NodeId::QuestionGate)),
            (NodeId::QuestionGate, Edge::Branch(after_question_gate as Branch)),
            (NodeId::Generate, Edge::To(NodeId::Validate)),
            (NodeId::Validate, Edge::Branch(after_validate as Branch)),
            (NodeId::Safety, Edge::Branch(after_safety as Branch)),
            (NodeId::Execute, Edge::Branch(after_execute as Branch)),
            (NodeId::Fix, Edge::To(NodeId::Validate)),
            (NodeId::Summarize, Edge::To(NodeId::HumanGate)),
            (NodeId::HumanGate, Edge::To(NodeId::End)),
        ]);

        for node in NodeId::ALL {
            if node != NodeId::End && !edges.contains_key(&node) {
                return Err(FlowError::Other(format!(
                    "graph node {} has no outgoing edge",
                    node
                )));
            }
        }
        Ok(Self { edges })
    }

    pub fn entry(&self) -> NodeId {
        NodeId::Normalize
    }

    pub fn next(&self, node: NodeId, state: &SynthesisState) -> NodeId {
        match self.edges.get(&node) {
            Some(Edge::To(next)) => *next,
            Some(Edge::Branch(branch)) => branch(state),
            None => NodeId::End,
        }
    }
}
