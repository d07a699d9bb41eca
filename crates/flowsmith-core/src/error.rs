//! Unified error types for flowsmith

use thiserror::Error;

/// Unified error type for all flowsmith operations
#[derive(Error, Debug)]
pub enum FlowError {
    // Configuration errors
    #[error("ai client is not configured")]
    ClientNotConfigured,

    #[error("{0}")]
    InvalidInput(String),

    // Backend errors
    #[error("chat backend error: {0}")]
    Chat(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("validation runner error: {0}")]
    Runner(String),

    // Loop errors
    #[error("loop max iterations reached ({0})")]
    MaxIterations(usize),

    #[error("loop budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("loop no progress detected")]
    NoProgress,

    #[error("{0} timeout")]
    Timeout(String),

    #[error("{0}")]
    Loop(String),

    // Validation errors
    #[error("workflow validation failed: {0}")]
    ValidationFailed(String),

    // Durable memory errors
    #[error("load {artifact} for session {session}: {message}")]
    MemoryLoad {
        session: String,
        artifact: String,
        message: String,
    },

    #[error("save loop memory for session {session}: {message}")]
    MemorySave { session: String, message: String },

    // Admission errors
    #[error("operation cancelled")]
    Cancelled,

    // Reporting errors
    #[error("{0}")]
    Report(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Whether this error came from the caller's cancellation context
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
