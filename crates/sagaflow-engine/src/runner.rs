//! The runner: one unit of forward progress per trigger.
//!
//! Every pass takes the per-execution lock, replays the full history
//! into fresh state, asserts the determinism signature, then performs
//! exactly one decision: consume buffered signals, complete or suspend
//! an inline step, schedule a task attempt, or finalize the execution.
//! Duplicate triggers re-derive the same state and no-op, so triggers
//! are safe to deliver at-least-once.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::{EngineError, ErrorInfo};
use crate::event::EventPayload;
use crate::graph::{
    signature, Graph, GraphRegistry, StepDefinition, StepFailure, StepScope, WorkflowView,
};
use crate::observe::{events, Notifier, NullNotifier};
use crate::replay::{replay, State, TaskStatus};
use crate::store::{
    ExecutionChanges, ExecutionRecord, ExecutionState, Store, StoreError, TaskDispatch,
    TaskHeaders, TriggerReason,
};
use crate::wait::{WaitContext, WaitInstruction};

/// What a runner pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Lock was held elsewhere; trigger dropped
    Skipped,
    /// Execution already reached a terminal state
    AlreadyFinished,
    /// Execution completed on this pass
    Completed,
    /// An inline step completed; a follow-up trigger was queued
    StepCompleted,
    /// Execution suspended on timers/signals
    Suspended,
    /// A task attempt was handed to the transport
    TaskScheduled,
    /// A task attempt is already in flight; nothing to do
    TaskInFlight,
    /// Execution failed terminally on this pass
    Failed,
    /// Execution was cancelled on this pass
    Cancelled,
}

/// Advances executions one decision at a time
pub struct Runner<S: Store> {
    store: Arc<S>,
    graphs: Arc<GraphRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl<S: Store> Runner<S> {
    pub fn new(store: Arc<S>, graphs: Arc<GraphRegistry>) -> Self {
        Self {
            store,
            graphs,
            notifier: Arc::new(NullNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run one pass, waiting for the lock
    #[tracing::instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn run(&self, execution_id: Uuid) -> Result<RunOutcome, EngineError> {
        let lease = self.store.lock_execution(execution_id, true).await?;
        // block=true always yields a lease
        let _lease = lease.ok_or(StoreError::Locked(execution_id))?;
        self.advance(execution_id).await
    }

    /// Run one pass, dropping the trigger if the lock is held. The
    /// holder re-derives any work this trigger represented.
    #[tracing::instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn try_run(&self, execution_id: Uuid) -> Result<RunOutcome, EngineError> {
        match self.store.lock_execution(execution_id, false).await? {
            Some(_lease) => self.advance(execution_id).await,
            None => {
                tracing::debug!("execution locked elsewhere, dropping trigger");
                Ok(RunOutcome::Skipped)
            }
        }
    }

    /// One decision, under the lock
    async fn advance(&self, execution_id: Uuid) -> Result<RunOutcome, EngineError> {
        let record = match self.store.get_execution(execution_id).await {
            Ok(record) => record,
            Err(StoreError::ExecutionNotFound(id)) => {
                return Err(EngineError::ExecutionNotFound(id))
            }
            Err(other) => return Err(other.into()),
        };
        let graph = self.graphs.get(&record.workflow)?;

        // fail closed on drifted workflow code before touching the log
        signature::assert_signature(&graph, record.graph_signature.as_deref())?;

        let history = self.store.load_history(execution_id).await?;
        let mut state = replay(&graph, &history);

        if record.state.is_terminal() || state.is_finished() {
            tracing::debug!(state = ?record.state, "execution already finished");
            return Ok(RunOutcome::AlreadyFinished);
        }

        // finalize before draining signals; a late arrival never delays
        // an execution that is already past its last step
        let Some(step) = graph.step_at(state.cursor_index).cloned() else {
            return self.complete_execution(&record).await;
        };

        self.consume_pending_signals(&graph, &record, &mut state)
            .await?;

        match &step.kind {
            crate::graph::StepKind::Task(task) => {
                self.advance_task_step(&graph, &record, &state, &step, task)
                    .await
            }
            crate::graph::StepKind::Inline(body) => {
                let body = Arc::clone(body);
                self.advance_inline_step(&graph, &record, &state, &step, &body)
                    .await
            }
        }
    }

    /// Hand buffered signals to their handlers, oldest first. A signal
    /// without a handler is consumed only while the current step waits
    /// on it; its payload lands in the context under the signal name.
    async fn consume_pending_signals(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &mut State,
    ) -> Result<(), EngineError> {
        let awaited: Vec<String> = state
            .awaiting
            .as_ref()
            .map(|awaiting| {
                awaiting
                    .instructions
                    .iter()
                    .filter_map(|i| i.signal_name().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let deliverable: Vec<(String, serde_json::Value)> = state
            .signals
            .pending()
            .filter(|signal| {
                graph.signal_handler(&signal.signal).is_some()
                    || awaited.contains(&signal.signal)
            })
            .map(|signal| (signal.signal.clone(), signal.payload.clone()))
            .collect();
        if deliverable.is_empty() {
            return Ok(());
        }

        for (name, payload) in &deliverable {
            if let Some(handler) = graph.signal_handler(name) {
                handler(&mut state.ctx, payload);
            } else {
                state.ctx.insert(name.clone(), payload.clone());
            }
            state.consume_signal(name);
            self.store
                .persist_signal_consumed(record.id, name)
                .await?;
            self.notifier.notify(
                events::SIGNAL_CONSUMED,
                json!({"execution_id": record.id, "signal": name}),
            );
            tracing::debug!(signal = %name, "signal consumed");
        }
        self.store
            .persist_context(record.id, state.ctx.clone())
            .await?;
        Ok(())
    }

    async fn advance_task_step(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
        step: &StepDefinition,
        task: &str,
    ) -> Result<RunOutcome, EngineError> {
        let policy = step.retry_policy();
        let attempt = match state.task(&step.name) {
            // attempt already scheduled or running; duplicate trigger
            Some(existing) if existing.status != TaskStatus::Failed => {
                tracing::debug!(step = %step.name, "task attempt in flight");
                return Ok(RunOutcome::TaskInFlight);
            }
            Some(failed) => {
                let next_attempt = failed.attempt + 1;
                if !failed.retryable || next_attempt > policy.max_attempts {
                    let error = failed
                        .last_error
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::new("task failed"));
                    return self
                        .fail_execution(graph, record, state, Some(&step.name), error)
                        .await;
                }
                next_attempt
            }
            None => 1,
        };

        let view = WorkflowView {
            execution_id: record.id,
            workflow: &record.workflow,
            ctx: &state.ctx,
            metadata: &record.metadata,
        };
        let idempotency_key = step.idempotency_key.evaluate(&view, &step.name);
        let arguments = step.arguments.resolve(&view);
        let run_at = policy.schedule_at(attempt, Utc::now());

        self.store
            .append_event(
                record.id,
                EventPayload::TaskScheduled {
                    step: step.name.clone(),
                    attempt,
                    arguments: arguments.clone(),
                    idempotency_key: idempotency_key.clone(),
                },
                // the key travels in the payload; the dedup column is
                // stamped on task_completed only, so retries of the
                // same step never collide on it
                None,
            )
            .await?;
        self.store
            .schedule_task(TaskDispatch {
                execution_id: record.id,
                step: step.name.clone(),
                task: task.to_owned(),
                arguments,
                headers: TaskHeaders {
                    execution_id: record.id,
                    workflow_name: record.workflow.clone(),
                    step_name: step.name.clone(),
                    attempt,
                    idempotency_key,
                    metadata: record.metadata.clone(),
                    compensation: false,
                    compensation_task: None,
                },
                run_at,
            })
            .await?;
        self.notifier.notify(
            events::TASK_SCHEDULED,
            json!({
                "execution_id": record.id,
                "step": step.name,
                "task": task,
                "attempt": attempt,
                "run_at": run_at,
            }),
        );
        tracing::info!(step = %step.name, task, attempt, "task attempt scheduled");
        Ok(RunOutcome::TaskScheduled)
    }

    async fn advance_inline_step(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
        step: &StepDefinition,
        body: &crate::graph::StepBody,
    ) -> Result<RunOutcome, EngineError> {
        let mut ctx = state.ctx.clone();
        let mut wait = WaitContext::new();
        let result = {
            let mut scope = StepScope {
                execution_id: record.id,
                workflow: &record.workflow,
                metadata: &record.metadata,
                ctx: &mut ctx,
                wait: &mut wait,
            };
            body(&mut scope)
        };

        match result {
            Err(StepFailure::Cancelled { reason }) => {
                self.cancel_execution(graph, record, state, Some(&step.name), reason)
                    .await
            }
            Err(StepFailure::Error(error)) => {
                self.fail_execution(graph, record, state, Some(&step.name), error)
                    .await
            }
            Ok(value) => {
                let instructions = wait.take();
                let satisfied = instructions.is_empty()
                    || instructions
                        .iter()
                        .any(|i| Self::instruction_satisfied(state, &step.name, i));
                if satisfied {
                    self.complete_step(graph, record, state, step, ctx, value)
                        .await
                } else if Self::already_waiting(state, &step.name, &instructions) {
                    tracing::debug!(step = %step.name, "still suspended, nothing new");
                    Ok(RunOutcome::Suspended)
                } else {
                    self.suspend_step(record, state, step, instructions).await
                }
            }
        }
    }

    /// A timer wait is satisfied once any timer for the step fired; a
    /// signal wait once an arrival was consumed for this step's own
    /// suspension. Both checks are scoped to the step, so a later wait
    /// on the same signal name suspends until its own arrival.
    fn instruction_satisfied(state: &State, step: &str, instruction: &WaitInstruction) -> bool {
        match instruction {
            WaitInstruction::Timer { .. } => state.timer_fired_for(step),
            WaitInstruction::Signal { signal, .. } => state.signal_consumed_for(step, signal),
        }
    }

    /// Re-declaring the identical wait while already suspended is a
    /// no-op: no new events, no duplicate timers.
    fn already_waiting(state: &State, step: &str, instructions: &[WaitInstruction]) -> bool {
        state
            .awaiting
            .as_ref()
            .is_some_and(|awaiting| awaiting.step == step && awaiting.instructions == instructions)
    }

    async fn suspend_step(
        &self,
        record: &ExecutionRecord,
        state: &State,
        step: &StepDefinition,
        instructions: Vec<WaitInstruction>,
    ) -> Result<RunOutcome, EngineError> {
        let now = Utc::now();
        self.store
            .append_event(
                record.id,
                EventPayload::StepWaiting {
                    step: step.name.clone(),
                    instructions: instructions.clone(),
                },
                None,
            )
            .await?;
        for instruction in &instructions {
            if instruction.is_timer() {
                let run_at = instruction.resolve_run_at(now)?;
                let timer = self
                    .store
                    .schedule_timer(
                        record.id,
                        &step.name,
                        run_at,
                        instruction.clone(),
                        serde_json::Value::Null,
                    )
                    .await?;
                self.notifier.notify(
                    events::TIMER_SCHEDULED,
                    json!({
                        "execution_id": record.id,
                        "step": step.name,
                        "timer_id": timer.id,
                        "run_at": run_at,
                    }),
                );
            }
        }
        // a signal buffered before this wait was recorded satisfies it;
        // queue a pass so the next run consumes it
        let buffered = instructions.iter().any(|instruction| {
            instruction
                .signal_name()
                .is_some_and(|name| state.signals.has_pending(name))
        });
        if buffered {
            self.store
                .enqueue_execution(record.id, TriggerReason::Signal)
                .await?;
        }
        self.notifier.notify(
            events::STEP_WAITING,
            json!({"execution_id": record.id, "step": step.name}),
        );
        tracing::info!(step = %step.name, waits = instructions.len(), "execution suspended");
        Ok(RunOutcome::Suspended)
    }

    async fn complete_step(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
        step: &StepDefinition,
        mut ctx: crate::Context,
        value: serde_json::Value,
    ) -> Result<RunOutcome, EngineError> {
        ctx.insert(step.name.clone(), value.clone());
        self.store.persist_context(record.id, ctx.clone()).await?;
        self.store
            .append_event(
                record.id,
                EventPayload::StepCompleted {
                    step: step.name.clone(),
                    result: value,
                    ctx_snapshot: ctx,
                },
                None,
            )
            .await?;

        let next_index = state.cursor_index + 1;
        let next_step = graph.step_at(next_index).map(|s| s.name.clone());
        let finished = next_index >= graph.steps().len();
        let mut changes = ExecutionChanges::new()
            .cursor(next_index, next_step)
            .clear_error();
        if finished {
            changes = changes.state(ExecutionState::Completed);
        }
        self.store.update_execution(record.id, changes).await?;
        self.notifier.notify(
            events::STEP_COMPLETED,
            json!({"execution_id": record.id, "step": step.name}),
        );
        tracing::info!(step = %step.name, "step completed");

        if finished {
            self.store
                .append_event(record.id, EventPayload::WorkflowCompleted, None)
                .await?;
            self.notifier.notify(
                events::EXECUTION_COMPLETED,
                json!({"execution_id": record.id, "workflow": record.workflow}),
            );
            tracing::info!("execution completed");
            Ok(RunOutcome::Completed)
        } else {
            self.store
                .enqueue_execution(record.id, TriggerReason::StepAdvanced)
                .await?;
            Ok(RunOutcome::StepCompleted)
        }
    }

    /// Cursor already past the last step (resumed after the final task
    /// completed elsewhere, or an empty workflow)
    async fn complete_execution(&self, record: &ExecutionRecord) -> Result<RunOutcome, EngineError> {
        self.store
            .update_execution(
                record.id,
                ExecutionChanges::new().state(ExecutionState::Completed),
            )
            .await?;
        self.store
            .append_event(record.id, EventPayload::WorkflowCompleted, None)
            .await?;
        self.notifier.notify(
            events::EXECUTION_COMPLETED,
            json!({"execution_id": record.id, "workflow": record.workflow}),
        );
        tracing::info!("execution completed");
        Ok(RunOutcome::Completed)
    }

    async fn fail_execution(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
        step: Option<&str>,
        error: ErrorInfo,
    ) -> Result<RunOutcome, EngineError> {
        self.store
            .append_event(
                record.id,
                EventPayload::WorkflowFailed {
                    step: step.map(str::to_owned),
                    error: error.clone(),
                },
                None,
            )
            .await?;
        self.store
            .update_execution(
                record.id,
                ExecutionChanges::new()
                    .state(ExecutionState::Failed)
                    .last_error(error.clone()),
            )
            .await?;
        self.notifier.notify(
            events::EXECUTION_FAILED,
            json!({
                "execution_id": record.id,
                "workflow": record.workflow,
                "step": step,
                "error": error.message,
            }),
        );
        tracing::warn!(?step, error = %error.message, "execution failed");
        self.schedule_compensations(graph, record, state).await?;
        Ok(RunOutcome::Failed)
    }

    async fn cancel_execution(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
        step: Option<&str>,
        reason: String,
    ) -> Result<RunOutcome, EngineError> {
        self.store
            .append_event(
                record.id,
                EventPayload::WorkflowCancelled {
                    step: step.map(str::to_owned),
                    reason: reason.clone(),
                },
                None,
            )
            .await?;
        self.store
            .update_execution(
                record.id,
                ExecutionChanges::new().state(ExecutionState::Cancelled),
            )
            .await?;
        self.notifier.notify(
            events::EXECUTION_CANCELLED,
            json!({
                "execution_id": record.id,
                "workflow": record.workflow,
                "step": step,
                "reason": reason,
            }),
        );
        tracing::info!(?step, %reason, "execution cancelled");
        self.schedule_compensations(graph, record, state).await?;
        Ok(RunOutcome::Cancelled)
    }

    /// Dispatch compensations for completed steps, newest completion
    /// unwound first (reverse declaration order); steps that never
    /// completed are skipped.
    async fn schedule_compensations(
        &self,
        graph: &Graph,
        record: &ExecutionRecord,
        state: &State,
    ) -> Result<(), EngineError> {
        for step in graph.steps().iter().rev() {
            let Some(task) = graph.compensation_for(&step.name) else {
                continue;
            };
            if !state.step_completed(&step.name) {
                continue;
            }
            let scheduled = self
                .store
                .schedule_compensation(record.id, &step.name, task)
                .await?;
            if scheduled {
                self.notifier.notify(
                    events::COMPENSATION_SCHEDULED,
                    json!({"execution_id": record.id, "step": step.name, "task": task}),
                );
                tracing::info!(step = %step.name, task, "compensation scheduled");
            }
        }
        Ok(())
    }
}
