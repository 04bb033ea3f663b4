//! Pure replay: rebuild execution state from the event log.
//!
//! [`replay`] folds an execution's events, in sequence order, into a
//! fresh [`State`]. The fold performs no I/O, takes no clock or random
//! input, and never mutates shared state, so the same history always
//! yields the same state.

mod signal_buffer;

pub use signal_buffer::{SignalBuffer, SignalRecord};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::event::{Event, EventPayload};
use crate::graph::Graph;
use crate::wait::WaitInstruction;
use crate::Context;

/// Where a step currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Suspended on timers/signals
    Waiting,
    /// A task attempt is scheduled or in flight
    TaskScheduled,
    Completed,
    Failed,
}

/// Replayed state of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub wait: Vec<WaitInstruction>,
}

/// Status of the latest task attempt for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Completed,
    Failed,
}

/// Replayed state of a step's delegated task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskState {
    pub step: String,
    pub status: TaskStatus,
    /// Latest attempt number (1-based)
    pub attempt: u32,
    pub idempotency_key: Option<String>,
    pub last_error: Option<ErrorInfo>,
    pub retryable: bool,
}

impl TaskState {
    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Replayed state of a timer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerState {
    pub timer_id: Uuid,
    pub step: String,
    pub run_at: Option<DateTime<Utc>>,
    pub fired: bool,
}

/// Suspension the execution is currently parked on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Awaiting {
    pub step: String,
    pub instructions: Vec<WaitInstruction>,
}

/// Status of one compensation dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Scheduled,
    Completed,
    Failed,
}

/// Replayed state of one compensation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationState {
    pub step: String,
    pub task: String,
    pub status: CompensationStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

/// Coarse facts about the execution as a whole
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub started: bool,
    pub finished: bool,
    /// Step names in completion order
    pub completed_steps: Vec<String>,
    pub error: Option<ErrorInfo>,
    pub cancel_reason: Option<String>,
    pub event_count: u64,
}

/// Full state of an execution rebuilt from its event log.
///
/// A fresh value per fold; nothing is cached between replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct State {
    /// Accumulated workflow context
    pub ctx: Context,
    /// Index of the next step to run (0-based declaration order)
    pub cursor_index: usize,
    /// Name of the next step to run, if any remain
    pub cursor_step: Option<String>,
    pub steps: BTreeMap<String, StepState>,
    pub tasks: BTreeMap<String, TaskState>,
    pub timers: BTreeMap<Uuid, TimerState>,
    pub signals: SignalBuffer,
    /// Signal names consumed while a step was suspended on them, by step
    pub signal_consumptions: BTreeMap<String, Vec<String>>,
    pub awaiting: Option<Awaiting>,
    pub compensations: Vec<CompensationState>,
    pub summary: ExecutionSummary,
}

impl State {
    pub fn is_finished(&self) -> bool {
        self.summary.finished
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    pub fn task(&self, step: &str) -> Option<&TaskState> {
        self.tasks.get(step)
    }

    pub fn step_completed(&self, name: &str) -> bool {
        self.steps
            .get(name)
            .is_some_and(|step| step.status == StepStatus::Completed)
    }

    /// Whether any timer for the step has fired
    pub fn timer_fired_for(&self, step: &str) -> bool {
        self.timers
            .values()
            .any(|timer| timer.step == step && timer.fired)
    }

    /// Whether a compensation dispatch for (step, task) was already recorded
    pub fn compensation_scheduled(&self, step: &str, task: &str) -> bool {
        self.compensations
            .iter()
            .any(|c| c.step == step && c.task == task)
    }

    /// Whether an arrival of `signal` was consumed while `step` was
    /// suspended waiting on it
    pub fn signal_consumed_for(&self, step: &str, signal: &str) -> bool {
        self.signal_consumptions
            .get(step)
            .is_some_and(|signals| signals.iter().any(|s| s == signal))
    }

    /// Consume the oldest pending arrival of `signal`, crediting it to
    /// the awaiting step when that step is suspended on this signal.
    /// Each wait spends its own arrival; a consumption credited to an
    /// earlier step never satisfies a later wait on the same name.
    pub fn consume_signal(&mut self, signal: &str) {
        self.signals.consume(signal);
        if let Some(awaiting) = &self.awaiting {
            let awaited = awaiting
                .instructions
                .iter()
                .any(|i| i.signal_name() == Some(signal));
            if awaited {
                self.signal_consumptions
                    .entry(awaiting.step.clone())
                    .or_default()
                    .push(signal.to_owned());
            }
        }
    }
}

/// Fold an execution's history into a fresh [`State`].
///
/// Events must be in sequence order. The graph supplies step naming
/// for the cursor; it is not consulted for anything the log records.
pub fn replay(graph: &Graph, events: &[Event]) -> State {
    let mut state = State::default();
    for event in events {
        apply(&mut state, event);
    }
    state.summary.event_count = events.len() as u64;
    state.cursor_step = graph
        .step_at(state.cursor_index)
        .map(|step| step.name.clone());
    state
}

fn apply(state: &mut State, event: &Event) {
    match &event.payload {
        EventPayload::WorkflowStarted { input } => {
            if let serde_json::Value::Object(map) = input {
                state.ctx = map.clone();
            }
            state.summary.started = true;
        }
        EventPayload::StepWaiting { step, instructions } => {
            state.steps.insert(
                step.clone(),
                StepState {
                    name: step.clone(),
                    status: StepStatus::Waiting,
                    result: None,
                    wait: instructions.clone(),
                },
            );
            state.awaiting = Some(Awaiting {
                step: step.clone(),
                instructions: instructions.clone(),
            });
        }
        EventPayload::StepCompleted {
            step,
            result,
            ctx_snapshot,
        } => {
            state.ctx = ctx_snapshot.clone();
            complete_step(state, step, result.clone());
        }
        EventPayload::TaskScheduled {
            step,
            attempt,
            idempotency_key,
            ..
        } => {
            state.tasks.insert(
                step.clone(),
                TaskState {
                    step: step.clone(),
                    status: TaskStatus::Scheduled,
                    attempt: *attempt,
                    idempotency_key: Some(idempotency_key.clone()),
                    last_error: None,
                    retryable: false,
                },
            );
            state.steps.insert(
                step.clone(),
                StepState {
                    name: step.clone(),
                    status: StepStatus::TaskScheduled,
                    result: None,
                    wait: Vec::new(),
                },
            );
        }
        EventPayload::TaskCompleted {
            step,
            attempt,
            result,
            ctx_snapshot,
        } => {
            state.ctx = ctx_snapshot.clone();
            if let Some(task) = state.tasks.get_mut(step) {
                task.status = TaskStatus::Completed;
                task.attempt = *attempt;
                task.last_error = None;
            }
            complete_step(state, step, result.clone());
        }
        EventPayload::TaskFailed {
            step,
            attempt,
            error,
            retryable,
        } => {
            let task = state.tasks.entry(step.clone()).or_insert_with(|| TaskState {
                step: step.clone(),
                status: TaskStatus::Failed,
                attempt: *attempt,
                idempotency_key: None,
                last_error: None,
                retryable: false,
            });
            task.status = TaskStatus::Failed;
            task.attempt = *attempt;
            task.last_error = Some(error.clone());
            task.retryable = *retryable;
        }
        EventPayload::TimerScheduled {
            timer_id,
            step,
            run_at,
            ..
        } => {
            state.timers.insert(
                *timer_id,
                TimerState {
                    timer_id: *timer_id,
                    step: step.clone(),
                    run_at: Some(*run_at),
                    fired: false,
                },
            );
        }
        EventPayload::TimerFired { timer_id, step } => {
            let timer = state.timers.entry(*timer_id).or_insert_with(|| TimerState {
                timer_id: *timer_id,
                step: step.clone(),
                run_at: None,
                fired: false,
            });
            timer.fired = true;
        }
        EventPayload::SignalReceived {
            signal,
            payload,
            metadata,
            received_at,
        } => {
            state
                .signals
                .push(signal.clone(), payload.clone(), metadata.clone(), *received_at);
        }
        EventPayload::SignalConsumed { signal } => {
            state.consume_signal(signal);
        }
        EventPayload::CompensationScheduled { step, task } => {
            state.compensations.push(CompensationState {
                step: step.clone(),
                task: task.clone(),
                status: CompensationStatus::Scheduled,
                result: None,
                error: None,
            });
        }
        EventPayload::CompensationCompleted { step, task, result } => {
            if let Some(compensation) = find_compensation(state, step, task) {
                compensation.status = CompensationStatus::Completed;
                compensation.result = Some(result.clone());
            }
        }
        EventPayload::CompensationFailed { step, task, error } => {
            if let Some(compensation) = find_compensation(state, step, task) {
                compensation.status = CompensationStatus::Failed;
                compensation.error = Some(error.clone());
            }
        }
        EventPayload::WorkflowCompleted => {
            state.summary.finished = true;
        }
        EventPayload::WorkflowFailed { error, .. } => {
            state.summary.finished = true;
            state.summary.error = Some(error.clone());
        }
        EventPayload::WorkflowCancelled { reason, .. } => {
            state.summary.finished = true;
            state.summary.cancel_reason = Some(reason.clone());
        }
    }
}

fn complete_step(state: &mut State, step: &str, result: serde_json::Value) {
    state.steps.insert(
        step.to_owned(),
        StepState {
            name: step.to_owned(),
            status: StepStatus::Completed,
            result: Some(result),
            wait: Vec::new(),
        },
    );
    if state
        .awaiting
        .as_ref()
        .is_some_and(|awaiting| awaiting.step == step)
    {
        state.awaiting = None;
    }
    state.summary.completed_steps.push(step.to_owned());
    state.cursor_index += 1;
}

fn find_compensation<'a>(
    state: &'a mut State,
    step: &str,
    task: &str,
) -> Option<&'a mut CompensationState> {
    state
        .compensations
        .iter_mut()
        .find(|c| c.step == step && c.task == task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use serde_json::json;

    fn event(execution_id: Uuid, sequence: u64, payload: EventPayload) -> Event {
        Event {
            id: Uuid::now_v7(),
            execution_id,
            sequence,
            payload,
            idempotency_key: None,
            recorded_at: Utc::now(),
        }
    }

    fn two_step_graph() -> Graph {
        Graph::builder("order")
            .task_step("reserve", "reserve_inventory")
            .task_step("charge", "charge_payment")
            .build()
            .unwrap()
    }

    fn sample_history(execution_id: Uuid) -> Vec<Event> {
        let mut snapshot = Context::new();
        snapshot.insert("reserve".into(), json!("held"));
        vec![
            event(
                execution_id,
                1,
                EventPayload::WorkflowStarted {
                    input: json!({"order_id": "ord-1"}),
                },
            ),
            event(
                execution_id,
                2,
                EventPayload::TaskScheduled {
                    step: "reserve".into(),
                    attempt: 1,
                    arguments: json!({}),
                    idempotency_key: "k1".into(),
                },
            ),
            event(
                execution_id,
                3,
                EventPayload::TaskCompleted {
                    step: "reserve".into(),
                    attempt: 1,
                    result: json!("held"),
                    ctx_snapshot: snapshot,
                },
            ),
        ]
    }

    #[test]
    fn test_replay_is_pure() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let history = sample_history(execution_id);

        let first = replay(&graph, &history);
        let second = replay(&graph, &history);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cursor_advances_on_completion() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let state = replay(&graph, &sample_history(execution_id));

        assert_eq!(state.cursor_index, 1);
        assert_eq!(state.cursor_step.as_deref(), Some("charge"));
        assert!(state.step_completed("reserve"));
        assert_eq!(state.summary.completed_steps, ["reserve"]);
        assert_eq!(state.ctx["reserve"], json!("held"));
    }

    #[test]
    fn test_task_failure_tracks_attempt_and_error() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let mut history = sample_history(execution_id);
        history.push(event(
            execution_id,
            4,
            EventPayload::TaskScheduled {
                step: "charge".into(),
                attempt: 1,
                arguments: json!({}),
                idempotency_key: "k2".into(),
            },
        ));
        history.push(event(
            execution_id,
            5,
            EventPayload::TaskFailed {
                step: "charge".into(),
                attempt: 1,
                error: ErrorInfo::new("card declined"),
                retryable: true,
            },
        ));

        let state = replay(&graph, &history);
        let task = state.task("charge").unwrap();
        assert!(task.is_failed());
        assert_eq!(task.attempt, 1);
        assert!(task.retryable);
        assert_eq!(task.last_error.as_ref().unwrap().message, "card declined");
        // failed task does not advance the cursor
        assert_eq!(state.cursor_index, 1);
    }

    #[test]
    fn test_awaiting_set_and_cleared() {
        let graph = Graph::builder("order")
            .inline_step("review", |_| Ok(json!(null)))
            .build()
            .unwrap();
        let execution_id = Uuid::now_v7();
        let instructions = vec![WaitInstruction::Signal {
            signal: "approval".into(),
            metadata: json!(null),
        }];
        let mut history = vec![
            event(execution_id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
            event(
                execution_id,
                2,
                EventPayload::StepWaiting {
                    step: "review".into(),
                    instructions: instructions.clone(),
                },
            ),
        ];

        let waiting = replay(&graph, &history);
        assert_eq!(waiting.awaiting.as_ref().unwrap().step, "review");
        assert_eq!(waiting.awaiting.as_ref().unwrap().instructions, instructions);

        history.push(event(
            execution_id,
            3,
            EventPayload::StepCompleted {
                step: "review".into(),
                result: json!(null),
                ctx_snapshot: Context::new(),
            },
        ));
        let resumed = replay(&graph, &history);
        assert!(resumed.awaiting.is_none());
        assert!(!resumed.is_finished());
    }

    #[test]
    fn test_signals_buffered_until_consumed() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let mut history = vec![event(
            execution_id,
            1,
            EventPayload::WorkflowStarted { input: json!({}) },
        )];
        history.push(event(
            execution_id,
            2,
            EventPayload::SignalReceived {
                signal: "approval".into(),
                payload: json!({"ok": true}),
                metadata: json!(null),
                received_at: Utc::now(),
            },
        ));

        let buffered = replay(&graph, &history);
        assert!(buffered.signals.has_pending("approval"));

        history.push(event(
            execution_id,
            3,
            EventPayload::SignalConsumed {
                signal: "approval".into(),
            },
        ));
        let consumed = replay(&graph, &history);
        assert!(!consumed.signals.has_pending("approval"));
        assert_eq!(consumed.signals.consumed_count("approval"), 1);
    }

    #[test]
    fn test_signal_consumption_credited_to_the_waiting_step() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let history = vec![
            event(execution_id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
            event(
                execution_id,
                2,
                EventPayload::StepWaiting {
                    step: "reserve".into(),
                    instructions: vec![WaitInstruction::Signal {
                        signal: "go".into(),
                        metadata: json!(null),
                    }],
                },
            ),
            event(
                execution_id,
                3,
                EventPayload::SignalReceived {
                    signal: "go".into(),
                    payload: json!(1),
                    metadata: json!(null),
                    received_at: Utc::now(),
                },
            ),
            event(
                execution_id,
                4,
                EventPayload::SignalConsumed { signal: "go".into() },
            ),
        ];
        let state = replay(&graph, &history);
        assert!(state.signal_consumed_for("reserve", "go"));
        // the arrival was spent on `reserve`; another step waiting on
        // the same name still needs its own
        assert!(!state.signal_consumed_for("charge", "go"));
    }

    #[test]
    fn test_timer_lifecycle() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let timer_id = Uuid::now_v7();
        let history = vec![
            event(execution_id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
            event(
                execution_id,
                2,
                EventPayload::TimerScheduled {
                    timer_id,
                    step: "reserve".into(),
                    run_at: Utc::now(),
                    metadata: json!(null),
                },
            ),
            event(
                execution_id,
                3,
                EventPayload::TimerFired {
                    timer_id,
                    step: "reserve".into(),
                },
            ),
        ];
        let state = replay(&graph, &history);
        assert!(state.timer_fired_for("reserve"));
        assert!(!state.timer_fired_for("charge"));
    }

    #[test]
    fn test_terminal_events_finish_the_summary() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let history = vec![
            event(execution_id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
            event(
                execution_id,
                2,
                EventPayload::WorkflowFailed {
                    step: Some("reserve".into()),
                    error: ErrorInfo::new("out of stock"),
                },
            ),
        ];
        let state = replay(&graph, &history);
        assert!(state.is_finished());
        assert_eq!(state.summary.error.as_ref().unwrap().message, "out of stock");
    }

    #[test]
    fn test_compensation_tracking() {
        let graph = two_step_graph();
        let execution_id = Uuid::now_v7();
        let history = vec![
            event(execution_id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
            event(
                execution_id,
                2,
                EventPayload::CompensationScheduled {
                    step: "reserve".into(),
                    task: "release_inventory".into(),
                },
            ),
            event(
                execution_id,
                3,
                EventPayload::CompensationCompleted {
                    step: "reserve".into(),
                    task: "release_inventory".into(),
                    result: json!("released"),
                },
            ),
        ];
        let state = replay(&graph, &history);
        assert!(state.compensation_scheduled("reserve", "release_inventory"));
        assert_eq!(state.compensations[0].status, CompensationStatus::Completed);
    }
}
