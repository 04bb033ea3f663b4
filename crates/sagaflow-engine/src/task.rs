//! Delegated task implementations.
//!
//! Tasks run out of process relative to the runner: they are handed a
//! dispatch by the job transport, execute without holding the
//! execution lock, and report their outcome back through the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::store::TaskHeaders;

/// Everything a task body may know about its invocation.
///
/// Passed explicitly; tasks hold no ambient execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Effect-dedup key; stable across attempts of this step
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

impl TaskContext {
    pub fn from_headers(headers: &TaskHeaders) -> Self {
        Self {
            execution_id: headers.execution_id,
            workflow_name: headers.workflow_name.clone(),
            step_name: headers.step_name.clone(),
            attempt: headers.attempt,
            idempotency_key: headers.idempotency_key.clone(),
            metadata: headers.metadata.clone(),
        }
    }
}

/// Failure raised by a task body
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub class: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
            details: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            message: self.message.clone(),
            class: self.class.clone(),
            details: self.details.clone(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        TaskError::new(error.to_string()).with_class("serde_json::Error")
    }
}

/// A task implementation registered under a name.
///
/// Because attempts can be duplicated by the transport, bodies should
/// key their external effects on `ctx.idempotency_key`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn perform(
        &self,
        ctx: &TaskContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}
