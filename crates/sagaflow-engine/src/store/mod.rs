//! Persistence boundary.
//!
//! [`Store`] is the seam between the engine and whatever durable
//! backend hosts it. Implementations provide a small set of
//! primitives (rows, events, locks, queues); the multi-step recording
//! operations are provided methods composed from those primitives, so
//! every backend inherits the same dedup and cursor-advance semantics.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::event::{Event, EventPayload};
use crate::graph::{Graph, QueryHandler};
use crate::idempotency;
use crate::replay::replay;
use crate::wait::WaitInstruction;
use crate::Context;

/// Errors from store implementations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("timer not found: {0}")]
    TimerNotFound(Uuid),

    #[error("execution {0} is locked by another runner")]
    Locked(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Lifecycle state of an execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

/// One workflow execution row.
///
/// `ctx` and the cursor are a materialized convenience; the event log
/// remains the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow: String,
    pub state: ExecutionState,
    pub ctx: Context,
    /// Index of the next step to run (0-based declaration order)
    pub cursor_index: usize,
    /// Name of the next step to run, if any remain
    pub cursor_step: Option<String>,
    /// Determinism signature captured at start
    pub graph_signature: Option<String>,
    pub metadata: serde_json::Value,
    pub last_error: Option<ErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to an execution row
#[derive(Debug, Clone, Default)]
pub struct ExecutionChanges {
    pub state: Option<ExecutionState>,
    pub cursor: Option<(usize, Option<String>)>,
    pub last_error: Option<Option<ErrorInfo>>,
}

impl ExecutionChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ExecutionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn cursor(mut self, index: usize, step: Option<String>) -> Self {
        self.cursor = Some((index, step));
        self
    }

    pub fn last_error(mut self, error: ErrorInfo) -> Self {
        self.last_error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }
}

/// Status of a timer row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Scheduled,
    Fired,
    Cancelled,
}

/// A durable timer for a waiting step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step: String,
    pub run_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub instruction: WaitInstruction,
    pub metadata: serde_json::Value,
    pub fired_at: Option<DateTime<Utc>>,
}

/// Status of a buffered signal row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Consumed,
}

/// A buffered signal delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub signal_name: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: SignalStatus,
    pub received_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Invocation headers carried with every task dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeaders {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    /// Attempt number (1-based)
    pub attempt: u32,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    /// Whether this dispatch compensates a completed step
    pub compensation: bool,
    /// Compensating task name when `compensation` is set
    pub compensation_task: Option<String>,
}

/// A task handed to the job transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub execution_id: Uuid,
    pub step: String,
    pub task: String,
    pub arguments: serde_json::Value,
    pub headers: TaskHeaders,
    /// Earliest time to run; `None` means immediately
    pub run_at: Option<DateTime<Utc>>,
}

/// Why an execution was enqueued for a runner pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Start,
    Signal,
    StepAdvanced,
    TaskCompleted,
    TaskFailed,
    TimerFired,
}

/// A queued request to run an execution forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTrigger {
    pub execution_id: Uuid,
    pub reason: TriggerReason,
    pub enqueued_at: DateTime<Utc>,
}

/// Exclusive hold on an execution, released on drop.
///
/// Carries whatever guard the backend uses (a mutex guard, an advisory
/// lock handle, a row lock tied to a transaction).
pub struct ExecutionLease {
    _guard: Box<dyn std::any::Any + Send>,
}

impl ExecutionLease {
    pub fn new(guard: impl std::any::Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExecutionLease")
    }
}

/// Persistence operations the engine needs.
///
/// Required methods are the backend primitives. Provided methods are
/// the recording operations the engine calls; they are composed from
/// the primitives and should not normally be overridden.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // --- primitives ---

    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError>;

    async fn update_execution(
        &self,
        execution_id: Uuid,
        changes: ExecutionChanges,
    ) -> Result<(), StoreError>;

    /// Overwrite the materialized context
    async fn persist_context(&self, execution_id: Uuid, ctx: Context) -> Result<(), StoreError>;

    /// Take the per-execution lock. With `block` false, returns `None`
    /// when another runner holds it; the caller drops the trigger and
    /// relies on the holder's follow-up triggers.
    async fn lock_execution(
        &self,
        execution_id: Uuid,
        block: bool,
    ) -> Result<Option<ExecutionLease>, StoreError>;

    /// Full history in sequence order
    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Append one event, assigning the next sequence number
    async fn append_event(
        &self,
        execution_id: Uuid,
        payload: EventPayload,
        idempotency_key: Option<String>,
    ) -> Result<Event, StoreError>;

    /// Queue a runner pass over the execution
    async fn enqueue_execution(
        &self,
        execution_id: Uuid,
        reason: TriggerReason,
    ) -> Result<(), StoreError>;

    /// Hand a task dispatch to the job transport
    async fn schedule_task(&self, dispatch: TaskDispatch) -> Result<(), StoreError>;

    async fn insert_timer(&self, timer: Timer) -> Result<(), StoreError>;

    /// Transition a timer to fired; `None` when it already fired or
    /// was cancelled, so each timer resumes the execution exactly once.
    async fn fire_timer(&self, timer_id: Uuid) -> Result<Option<Timer>, StoreError>;

    /// Scheduled timers with `run_at <= now`, oldest first
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Timer>, StoreError>;

    async fn insert_signal_message(&self, message: SignalMessage) -> Result<(), StoreError>;

    /// Mark the oldest pending message of `signal_name` consumed
    async fn consume_signal_message(
        &self,
        execution_id: Uuid,
        signal_name: &str,
    ) -> Result<Option<SignalMessage>, StoreError>;

    // --- composed recording operations ---

    /// Create an execution, record `workflow_started`, queue the first
    /// runner pass.
    async fn start_execution(
        &self,
        graph: &Graph,
        input: Context,
        graph_signature: String,
    ) -> Result<ExecutionRecord, StoreError> {
        let now = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::now_v7(),
            workflow: graph.name().to_owned(),
            state: ExecutionState::Running,
            ctx: input.clone(),
            cursor_index: 0,
            cursor_step: graph.step_at(0).map(|step| step.name.clone()),
            graph_signature: Some(graph_signature),
            metadata: serde_json::Value::Null,
            last_error: None,
            started_at: now,
            updated_at: now,
        };
        self.insert_execution(record.clone()).await?;
        self.append_event(
            record.id,
            EventPayload::WorkflowStarted {
                input: serde_json::Value::Object(input),
            },
            None,
        )
        .await?;
        self.enqueue_execution(record.id, TriggerReason::Start).await?;
        Ok(record)
    }

    /// Buffer a signal, record its arrival, queue a runner pass.
    async fn signal_execution(
        &self,
        execution_id: Uuid,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.insert_signal_message(SignalMessage {
            id: Uuid::now_v7(),
            execution_id,
            signal_name: signal_name.to_owned(),
            payload: payload.clone(),
            metadata: serde_json::Value::Null,
            status: SignalStatus::Pending,
            received_at: now,
            consumed_at: None,
        })
        .await?;
        self.append_event(
            execution_id,
            EventPayload::SignalReceived {
                signal: signal_name.to_owned(),
                payload,
                metadata: serde_json::Value::Null,
                received_at: now,
            },
            None,
        )
        .await?;
        self.enqueue_execution(execution_id, TriggerReason::Signal)
            .await?;
        Ok(())
    }

    /// Consume the oldest pending message of `signal_name` and record
    /// the consumption. Returns the consumed message, if any.
    async fn persist_signal_consumed(
        &self,
        execution_id: Uuid,
        signal_name: &str,
    ) -> Result<Option<SignalMessage>, StoreError> {
        let Some(message) = self.consume_signal_message(execution_id, signal_name).await? else {
            return Ok(None);
        };
        self.append_event(
            execution_id,
            EventPayload::SignalConsumed {
                signal: signal_name.to_owned(),
            },
            None,
        )
        .await?;
        Ok(Some(message))
    }

    /// Create a timer row and record its scheduling.
    async fn schedule_timer(
        &self,
        execution_id: Uuid,
        step: &str,
        run_at: DateTime<Utc>,
        instruction: WaitInstruction,
        metadata: serde_json::Value,
    ) -> Result<Timer, StoreError> {
        let timer = Timer {
            id: Uuid::now_v7(),
            execution_id,
            step: step.to_owned(),
            run_at,
            status: TimerStatus::Scheduled,
            instruction,
            metadata: metadata.clone(),
            fired_at: None,
        };
        self.insert_timer(timer.clone()).await?;
        self.append_event(
            execution_id,
            EventPayload::TimerScheduled {
                timer_id: timer.id,
                step: step.to_owned(),
                run_at,
                metadata,
            },
            None,
        )
        .await?;
        Ok(timer)
    }

    /// Fire a timer, record the firing, queue a runner pass. `None`
    /// when the timer already fired.
    async fn mark_timer_fired(&self, timer_id: Uuid) -> Result<Option<Timer>, StoreError> {
        let Some(timer) = self.fire_timer(timer_id).await? else {
            return Ok(None);
        };
        self.append_event(
            timer.execution_id,
            EventPayload::TimerFired {
                timer_id,
                step: timer.step.clone(),
            },
            None,
        )
        .await?;
        self.enqueue_execution(timer.execution_id, TriggerReason::TimerFired)
            .await?;
        Ok(Some(timer))
    }

    /// Record a successful task attempt and advance the cursor.
    ///
    /// A completion whose idempotency key already has an effective
    /// `task_completed` in the history is dropped, so duplicated
    /// attempts collapse to at most one effect. Returns whether the
    /// result was recorded.
    async fn record_task_result(
        &self,
        graph: &Graph,
        execution_id: Uuid,
        step: &str,
        result: serde_json::Value,
        attempt: u32,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let history = self.load_history(execution_id).await?;
        let duplicate = history.iter().any(|event| {
            matches!(event.payload, EventPayload::TaskCompleted { .. })
                && event.idempotency_key.as_deref() == Some(idempotency_key)
        });
        if duplicate {
            return Ok(false);
        }

        let record = self.get_execution(execution_id).await?;
        if record.state.is_terminal() {
            return Ok(false);
        }

        let step_index = graph
            .steps()
            .iter()
            .position(|s| s.name == step)
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "step `{step}` is not part of workflow `{}`",
                    graph.name()
                ))
            })?;

        let mut ctx = record.ctx;
        ctx.insert(step.to_owned(), result.clone());
        self.persist_context(execution_id, ctx.clone()).await?;
        self.append_event(
            execution_id,
            EventPayload::TaskCompleted {
                step: step.to_owned(),
                attempt,
                result,
                ctx_snapshot: ctx,
            },
            Some(idempotency_key.to_owned()),
        )
        .await?;

        let next_index = step_index + 1;
        let next_step = graph.step_at(next_index).map(|s| s.name.clone());
        let finished = next_index >= graph.steps().len();
        let mut changes = ExecutionChanges::new()
            .cursor(next_index, next_step)
            .clear_error();
        if finished {
            changes = changes.state(ExecutionState::Completed);
        }
        self.update_execution(execution_id, changes).await?;

        if finished {
            self.append_event(execution_id, EventPayload::WorkflowCompleted, None)
                .await?;
        } else {
            self.enqueue_execution(execution_id, TriggerReason::TaskCompleted)
                .await?;
        }
        Ok(true)
    }

    /// Record a failed task attempt and queue a runner pass. The
    /// execution stays running; the runner decides between retry and
    /// terminal failure under the lock.
    async fn record_task_failure(
        &self,
        execution_id: Uuid,
        step: &str,
        attempt: u32,
        error: ErrorInfo,
        retryable: bool,
    ) -> Result<(), StoreError> {
        let record = self.get_execution(execution_id).await?;
        if record.state.is_terminal() {
            return Ok(());
        }
        self.append_event(
            execution_id,
            EventPayload::TaskFailed {
                step: step.to_owned(),
                attempt,
                error: error.clone(),
                retryable,
            },
            None,
        )
        .await?;
        self.update_execution(execution_id, ExecutionChanges::new().last_error(error))
            .await?;
        self.enqueue_execution(execution_id, TriggerReason::TaskFailed)
            .await?;
        Ok(())
    }

    /// Dispatch the compensating task for a completed step, at most
    /// once per (step, task). Returns whether a dispatch was created.
    async fn schedule_compensation(
        &self,
        execution_id: Uuid,
        step: &str,
        task: &str,
    ) -> Result<bool, StoreError> {
        let history = self.load_history(execution_id).await?;
        let already = history.iter().any(|event| {
            matches!(
                &event.payload,
                EventPayload::CompensationScheduled { step: s, task: t }
                    if s == step && t == task
            )
        });
        if already {
            return Ok(false);
        }

        let record = self.get_execution(execution_id).await?;
        self.append_event(
            execution_id,
            EventPayload::CompensationScheduled {
                step: step.to_owned(),
                task: task.to_owned(),
            },
            None,
        )
        .await?;
        let headers = TaskHeaders {
            execution_id,
            workflow_name: record.workflow.clone(),
            step_name: step.to_owned(),
            attempt: 1,
            idempotency_key: idempotency::digest([
                execution_id.to_string().as_str(),
                step,
                task,
                "compensation",
            ]),
            metadata: record.metadata.clone(),
            compensation: true,
            compensation_task: Some(task.to_owned()),
        };
        self.schedule_task(TaskDispatch {
            execution_id,
            step: step.to_owned(),
            task: task.to_owned(),
            arguments: serde_json::Value::Object(record.ctx),
            headers,
            run_at: None,
        })
        .await?;
        Ok(true)
    }

    /// Record a compensation outcome (best-effort, never retried).
    async fn record_compensation_result(
        &self,
        execution_id: Uuid,
        step: &str,
        task: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.append_event(
            execution_id,
            EventPayload::CompensationCompleted {
                step: step.to_owned(),
                task: task.to_owned(),
                result,
            },
            None,
        )
        .await?;
        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        execution_id: Uuid,
        step: &str,
        task: &str,
        error: ErrorInfo,
    ) -> Result<(), StoreError> {
        self.append_event(
            execution_id,
            EventPayload::CompensationFailed {
                step: step.to_owned(),
                task: task.to_owned(),
                error,
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Run a query handler against replayed state. Read-only; takes no
    /// lock and appends nothing.
    async fn query_execution(
        &self,
        graph: &Graph,
        execution_id: Uuid,
        handler: &QueryHandler,
    ) -> Result<serde_json::Value, StoreError> {
        let history = self.load_history(execution_id).await?;
        let state = replay(graph, &history);
        Ok(handler(&state))
    }
}
