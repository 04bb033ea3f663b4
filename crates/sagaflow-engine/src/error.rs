//! Engine error taxonomy

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

/// Structured error payload recorded in events and on executions.
///
/// This is the serializable form of a fault: what happened, the class of
/// failure if known, and any extra details captured at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error message
    pub message: String,

    /// Class/type of the originating fault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Additional details (for debugging)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    /// Create a new error payload
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
            details: None,
        }
    }

    /// Set the fault class
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Add details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors surfaced by the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unregistered workflow or task name, or invalid wiring
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Workflow code drifted from a running execution's recorded graph.
    /// Fatal to the run; raised before any event is appended.
    #[error("workflow definition diverged from persisted graph signature (expected: {expected}, actual: {actual})")]
    Determinism { expected: String, actual: String },

    /// Missing aggregate
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Fault from a delegated task body
    #[error("task execution failed: {0}")]
    TaskFailure(ErrorInfo),

    /// Cooperative cancellation raised inside an inline step body
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Reserved; timeout enforcement is delegated to the task execution boundary
    #[error("timed out")]
    Timeout,

    /// Signal name not declared on the workflow
    #[error("unknown signal `{0}`")]
    UnknownSignal(String),

    /// Query name not declared on the workflow
    #[error("unknown query `{0}`")]
    UnknownQuery(String),

    /// Step name not defined on the workflow
    #[error("step `{0}` is not defined on this workflow")]
    InvalidStep(String),

    /// Malformed suspension instruction
    #[error("invalid wait instruction: {0}")]
    WaitInstruction(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
