//! Engine notifications.
//!
//! Every interesting transition emits a named notification with a
//! structured payload. Emission is fire-and-forget: a notifier must
//! never fail or block the run that produced the event.

use serde_json::Value;

/// Notification names emitted by the engine
pub mod events {
    pub const EXECUTION_STARTED: &str = "sagaflow.execution.started";
    pub const EXECUTION_COMPLETED: &str = "sagaflow.execution.completed";
    pub const EXECUTION_FAILED: &str = "sagaflow.execution.failed";
    pub const EXECUTION_CANCELLED: &str = "sagaflow.execution.cancelled";
    pub const STEP_COMPLETED: &str = "sagaflow.step.completed";
    pub const STEP_WAITING: &str = "sagaflow.step.waiting";
    pub const TASK_SCHEDULED: &str = "sagaflow.task.scheduled";
    pub const TASK_COMPLETED: &str = "sagaflow.task.completed";
    pub const TASK_FAILED: &str = "sagaflow.task.failed";
    pub const TIMER_SCHEDULED: &str = "sagaflow.timer.scheduled";
    pub const TIMER_FIRED: &str = "sagaflow.timer.fired";
    pub const SIGNAL_RECEIVED: &str = "sagaflow.signal.received";
    pub const SIGNAL_CONSUMED: &str = "sagaflow.signal.consumed";
    pub const COMPENSATION_SCHEDULED: &str = "sagaflow.compensation.scheduled";
    pub const COMPENSATION_COMPLETED: &str = "sagaflow.compensation.completed";
    pub const COMPENSATION_FAILED: &str = "sagaflow.compensation.failed";
}

/// Sink for engine notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, payload: Value);
}

/// Emits notifications as structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &str, payload: Value) {
        tracing::info!(target: "sagaflow", event, %payload);
    }
}

/// Discards all notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &str, _payload: Value) {}
}

/// Captures notifications for assertions in tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    records: parking_lot::Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, Value)> {
        self.records.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.records.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.records.lock().iter().filter(|(name, _)| name == event).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &str, payload: Value) {
        self.records.lock().push((event.to_owned(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(events::STEP_COMPLETED, json!({"step": "charge"}));
        notifier.notify(events::STEP_COMPLETED, json!({"step": "confirm"}));
        notifier.notify(events::EXECUTION_COMPLETED, json!({}));

        assert_eq!(notifier.count(events::STEP_COMPLETED), 2);
        assert_eq!(notifier.count(events::EXECUTION_COMPLETED), 1);
        assert_eq!(notifier.records()[0].1["step"], "charge");
    }
}
