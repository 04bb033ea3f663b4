//! Suspension instructions collected by inline step bodies

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retry::option_duration_millis;

/// A single suspension condition declared by an inline step body.
///
/// A step may declare several instructions in one run; the first one
/// satisfied resumes the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitInstruction {
    /// Resume after a relative delay or at an absolute time
    Timer {
        #[serde(default, with = "option_duration_millis")]
        delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },
    /// Resume when a named signal arrives
    Signal {
        signal: String,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },
}

impl WaitInstruction {
    pub fn is_timer(&self) -> bool {
        matches!(self, WaitInstruction::Timer { .. })
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, WaitInstruction::Signal { .. })
    }

    /// Signal name for signal instructions
    pub fn signal_name(&self) -> Option<&str> {
        match self {
            WaitInstruction::Signal { signal, .. } => Some(signal),
            WaitInstruction::Timer { .. } => None,
        }
    }

    /// Resolve a timer instruction to an absolute fire time.
    ///
    /// A timer with neither a delay nor an absolute time is rejected
    /// here, at scheduling, not when the body declared it.
    pub fn resolve_run_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        match self {
            WaitInstruction::Timer { delay, run_at, .. } => {
                if let Some(at) = run_at {
                    return Ok(*at);
                }
                if let Some(delay) = delay {
                    let millis = delay.as_millis().min(i64::MAX as u128) as i64;
                    return Ok(now + chrono::Duration::milliseconds(millis));
                }
                Err(EngineError::WaitInstruction(
                    "timer requires a delay or an absolute time".into(),
                ))
            }
            WaitInstruction::Signal { .. } => Err(EngineError::WaitInstruction(
                "signal instructions have no fire time".into(),
            )),
        }
    }
}

/// Collector handed to inline step bodies for declaring suspension.
///
/// Declaring any instruction makes the current run suspend instead of
/// completing the step; the step body re-runs from the top on resume.
#[derive(Debug, Default)]
pub struct WaitContext {
    instructions: Vec<WaitInstruction>,
}

impl WaitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until `delay` has elapsed
    pub fn sleep_for(&mut self, delay: Duration) {
        self.instructions.push(WaitInstruction::Timer {
            delay: Some(delay),
            run_at: None,
            metadata: serde_json::Value::Null,
        });
    }

    /// Suspend until the given wall-clock time
    pub fn sleep_until(&mut self, at: DateTime<Utc>) {
        self.instructions.push(WaitInstruction::Timer {
            delay: None,
            run_at: Some(at),
            metadata: serde_json::Value::Null,
        });
    }

    /// Suspend until the named signal arrives
    pub fn for_signal(&mut self, signal: impl Into<String>) {
        self.instructions.push(WaitInstruction::Signal {
            signal: signal.into(),
            metadata: serde_json::Value::Null,
        });
    }

    /// Declare a fully specified instruction
    pub fn push(&mut self, instruction: WaitInstruction) {
        self.instructions.push(instruction);
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[WaitInstruction] {
        &self.instructions
    }

    pub(crate) fn take(&mut self) -> Vec<WaitInstruction> {
        std::mem::take(&mut self.instructions)
    }
}
