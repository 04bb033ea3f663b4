//! Job entry points: what the transport invokes.
//!
//! Three kinds of work arrive from outside the runner's lock: queued
//! execution triggers, task dispatches, and the periodic timer sweep.
//! Task bodies run without the lock; only outcome recording takes it.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::{GraphRegistry, TaskRegistry};
use crate::observe::{events, Notifier};
use crate::runner::{RunOutcome, Runner};
use crate::store::{Store, StoreError, TaskDispatch};
use crate::task::TaskContext;

/// Handle a queued execution trigger. Triggers for unknown executions
/// are logged and dropped, not retried; `None` reports that case.
pub async fn run_execution<S: Store>(
    runner: &Runner<S>,
    execution_id: Uuid,
) -> Result<Option<RunOutcome>, EngineError> {
    match runner.try_run(execution_id).await {
        Ok(outcome) => Ok(Some(outcome)),
        Err(EngineError::ExecutionNotFound(id)) => {
            tracing::warn!(execution_id = %id, "trigger for unknown execution dropped");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

/// Execute one task dispatch and record its outcome.
///
/// A failed attempt is retryable while attempts remain under the
/// step's policy; compensation dispatches are never retried.
#[tracing::instrument(
    skip(store, graphs, tasks, notifier, dispatch),
    fields(execution_id = %dispatch.execution_id, step = %dispatch.step, task = %dispatch.task)
)]
pub async fn run_task<S: Store>(
    store: &S,
    graphs: &GraphRegistry,
    tasks: &TaskRegistry,
    notifier: &dyn Notifier,
    dispatch: TaskDispatch,
) -> Result<(), EngineError> {
    let task = tasks.get(&dispatch.task)?;
    let ctx = TaskContext::from_headers(&dispatch.headers);
    let outcome = task.perform(&ctx, dispatch.arguments.clone()).await;

    if dispatch.headers.compensation {
        match outcome {
            Ok(result) => {
                store
                    .record_compensation_result(
                        dispatch.execution_id,
                        &dispatch.headers.step_name,
                        &dispatch.task,
                        result,
                    )
                    .await?;
                notifier.notify(
                    events::COMPENSATION_COMPLETED,
                    json!({
                        "execution_id": dispatch.execution_id,
                        "step": dispatch.headers.step_name,
                        "task": dispatch.task,
                    }),
                );
            }
            Err(error) => {
                tracing::warn!(error = %error, "compensation failed, not retrying");
                store
                    .record_compensation_failure(
                        dispatch.execution_id,
                        &dispatch.headers.step_name,
                        &dispatch.task,
                        error.to_error_info(),
                    )
                    .await?;
                notifier.notify(
                    events::COMPENSATION_FAILED,
                    json!({
                        "execution_id": dispatch.execution_id,
                        "step": dispatch.headers.step_name,
                        "task": dispatch.task,
                        "error": error.message,
                    }),
                );
            }
        }
        return Ok(());
    }

    let graph = graphs.get(&dispatch.headers.workflow_name)?;
    match outcome {
        Ok(result) => {
            let lease = store.lock_execution(dispatch.execution_id, true).await?;
            let _lease = lease.ok_or(StoreError::Locked(dispatch.execution_id))?;
            let recorded = store
                .record_task_result(
                    &graph,
                    dispatch.execution_id,
                    &dispatch.step,
                    result,
                    dispatch.headers.attempt,
                    &dispatch.headers.idempotency_key,
                )
                .await?;
            if recorded {
                notifier.notify(
                    events::TASK_COMPLETED,
                    json!({
                        "execution_id": dispatch.execution_id,
                        "step": dispatch.step,
                        "attempt": dispatch.headers.attempt,
                    }),
                );
            } else {
                tracing::debug!("duplicate task completion dropped");
            }
        }
        Err(error) => {
            let max_attempts = graph
                .step_named(&dispatch.step)
                .map(|step| step.retry_policy().max_attempts)
                .unwrap_or(1);
            let retryable = dispatch.headers.attempt < max_attempts;
            tracing::warn!(
                error = %error,
                attempt = dispatch.headers.attempt,
                retryable,
                "task attempt failed"
            );
            let lease = store.lock_execution(dispatch.execution_id, true).await?;
            let _lease = lease.ok_or(StoreError::Locked(dispatch.execution_id))?;
            store
                .record_task_failure(
                    dispatch.execution_id,
                    &dispatch.step,
                    dispatch.headers.attempt,
                    error.to_error_info(),
                    retryable,
                )
                .await?;
            notifier.notify(
                events::TASK_FAILED,
                json!({
                    "execution_id": dispatch.execution_id,
                    "step": dispatch.step,
                    "attempt": dispatch.headers.attempt,
                    "retryable": retryable,
                    "error": error.message,
                }),
            );
        }
    }
    Ok(())
}

/// Fire due timers, at most `batch_size` per sweep. Each timer resumes
/// its execution exactly once; returns how many fired.
pub async fn sweep_timers<S: Store>(
    store: &S,
    notifier: &dyn Notifier,
    batch_size: usize,
) -> Result<usize, EngineError> {
    let due = store.due_timers(Utc::now(), batch_size).await?;
    let mut fired = 0;
    for timer in due {
        if let Some(timer) = store.mark_timer_fired(timer.id).await? {
            fired += 1;
            notifier.notify(
                events::TIMER_FIRED,
                json!({
                    "execution_id": timer.execution_id,
                    "step": timer.step,
                    "timer_id": timer.id,
                }),
            );
            tracing::debug!(timer_id = %timer.id, step = %timer.step, "timer fired");
        }
    }
    Ok(fired)
}
