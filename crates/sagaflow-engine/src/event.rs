//! Execution event log types.
//!
//! Events are the sole source of truth for an execution: every state
//! transition is recorded as an immutable, append-only event, and all
//! in-memory state is rebuilt by replaying the log in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::wait::WaitInstruction;
use crate::Context;

/// A persisted event in an execution's history.
///
/// `sequence` is 1-based and gapless within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: Uuid,

    /// Execution this event belongs to
    pub execution_id: Uuid,

    /// Position in the execution's history (1-based, no gaps)
    pub sequence: u64,

    /// What happened
    #[serde(flatten)]
    pub payload: EventPayload,

    /// Effect-dedup key, populated on task completion events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Whether this event closes the execution
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Every transition an execution can record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Execution created with its input
    WorkflowStarted { input: serde_json::Value },

    /// Inline step suspended on timers and/or signals
    StepWaiting {
        step: String,
        instructions: Vec<WaitInstruction>,
    },

    /// Inline step finished; snapshot of the context it produced
    StepCompleted {
        step: String,
        result: serde_json::Value,
        ctx_snapshot: Context,
    },

    /// Delegated task attempt handed to the job transport
    TaskScheduled {
        step: String,
        attempt: u32,
        arguments: serde_json::Value,
        idempotency_key: String,
    },

    /// Delegated task attempt succeeded
    TaskCompleted {
        step: String,
        attempt: u32,
        result: serde_json::Value,
        ctx_snapshot: Context,
    },

    /// Delegated task attempt failed
    TaskFailed {
        step: String,
        attempt: u32,
        error: ErrorInfo,
        retryable: bool,
    },

    /// Timer row created for a waiting step
    TimerScheduled {
        timer_id: Uuid,
        step: String,
        run_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },

    /// Timer came due and resumed the execution
    TimerFired { timer_id: Uuid, step: String },

    /// External signal delivered (buffered until consumed)
    SignalReceived {
        signal: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
        received_at: DateTime<Utc>,
    },

    /// Buffered signal handed to its handler
    SignalConsumed { signal: String },

    /// Compensating task queued during unwind
    CompensationScheduled { step: String, task: String },

    /// Compensating task succeeded
    CompensationCompleted {
        step: String,
        task: String,
        result: serde_json::Value,
    },

    /// Compensating task failed (best-effort, not retried)
    CompensationFailed {
        step: String,
        task: String,
        error: ErrorInfo,
    },

    /// All steps completed
    WorkflowCompleted,

    /// Execution failed after exhausting retries
    WorkflowFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        error: ErrorInfo,
    },

    /// Execution cancelled from inside a step body
    WorkflowCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        reason: String,
    },
}

impl EventPayload {
    /// Snake-case event name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::WorkflowStarted { .. } => "workflow_started",
            EventPayload::StepWaiting { .. } => "step_waiting",
            EventPayload::StepCompleted { .. } => "step_completed",
            EventPayload::TaskScheduled { .. } => "task_scheduled",
            EventPayload::TaskCompleted { .. } => "task_completed",
            EventPayload::TaskFailed { .. } => "task_failed",
            EventPayload::TimerScheduled { .. } => "timer_scheduled",
            EventPayload::TimerFired { .. } => "timer_fired",
            EventPayload::SignalReceived { .. } => "signal_received",
            EventPayload::SignalConsumed { .. } => "signal_consumed",
            EventPayload::CompensationScheduled { .. } => "compensation_scheduled",
            EventPayload::CompensationCompleted { .. } => "compensation_completed",
            EventPayload::CompensationFailed { .. } => "compensation_failed",
            EventPayload::WorkflowCompleted => "workflow_completed",
            EventPayload::WorkflowFailed { .. } => "workflow_failed",
            EventPayload::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }

    /// Whether this payload closes the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::WorkflowCompleted
                | EventPayload::WorkflowFailed { .. }
                | EventPayload::WorkflowCancelled { .. }
        )
    }
}
