//! End-to-end scenarios driven through the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use sagaflow_engine::observe::RecordingNotifier;
use sagaflow_engine::prelude::*;
use sagaflow_engine::replay::replay;
use sagaflow_engine::testing;
use sagaflow_engine::{EventPayload, IdempotencyKey, StepKind};

/// Succeeds with a fixed result
struct StaticTask(Value);

#[async_trait]
impl Task for StaticTask {
    async fn perform(&self, _ctx: &TaskContext, _arguments: Value) -> Result<Value, TaskError> {
        Ok(self.0.clone())
    }
}

/// Always fails
struct FailingTask(&'static str);

#[async_trait]
impl Task for FailingTask {
    async fn perform(&self, _ctx: &TaskContext, _arguments: Value) -> Result<Value, TaskError> {
        Err(TaskError::new(self.0).with_class("TaskExploded"))
    }
}

/// Fails the first `n` attempts, then succeeds
struct FlakyTask {
    failures: AtomicU32,
    result: Value,
}

impl FlakyTask {
    fn new(failures: u32, result: Value) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            result,
        }
    }
}

#[async_trait]
impl Task for FlakyTask {
    async fn perform(&self, _ctx: &TaskContext, _arguments: Value) -> Result<Value, TaskError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(TaskError::new("transient failure"))
        } else {
            Ok(self.result.clone())
        }
    }
}

async fn event_types(engine: &Engine<MemoryStore>, execution_id: uuid::Uuid) -> Vec<&'static str> {
    engine
        .store()
        .load_history(execution_id)
        .await
        .unwrap()
        .iter()
        .map(|event| event.payload.event_type())
        .collect()
}

#[tokio::test]
async fn test_task_workflow_runs_to_completion() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .task_step("reserve", "reserve_inventory")
            .task_step("charge", "charge_payment")
            .build()
            .unwrap(),
    );
    engine.register_task("reserve_inventory", StaticTask(json!("held")));
    engine.register_task("charge_payment", StaticTask(json!("paid")));

    let record = testing::start_and_drain(&engine, "order", json!({"order_id": "ord-1"}))
        .await
        .unwrap();

    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["reserve"], json!("held"));
    assert_eq!(record.ctx["charge"], json!("paid"));
    assert_eq!(record.cursor_index, 2);
    assert_eq!(
        event_types(&engine, record.id).await,
        [
            "workflow_started",
            "task_scheduled",
            "task_completed",
            "task_scheduled",
            "task_completed",
            "workflow_completed",
        ]
    );
}

#[tokio::test]
async fn test_replay_of_real_history_is_deterministic() {
    let graph = Graph::builder("order")
        .task_step("reserve", "reserve_inventory")
        .task_step("charge", "charge_payment")
        .build()
        .unwrap();
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(graph.clone());
    engine.register_task("reserve_inventory", StaticTask(json!("held")));
    engine.register_task("charge_payment", StaticTask(json!("paid")));

    let record = testing::start_and_drain(&engine, "order", json!({}))
        .await
        .unwrap();
    let history = engine.store().load_history(record.id).await.unwrap();

    let first = replay(&graph, &history);
    let second = replay(&graph, &history);
    assert_eq!(first, second);
    assert!(first.is_finished());
    assert_eq!(first.summary.completed_steps, ["reserve", "charge"]);
    assert_eq!(first.ctx, record.ctx);
}

#[tokio::test]
async fn test_duplicate_task_completion_has_one_effect() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .step(
                StepDefinition::task("charge", "charge_payment")
                    .with_idempotency_key(IdempotencyKey::Literal("charge-ord-1".into())),
            )
            .build()
            .unwrap(),
    );
    engine.register_task("charge_payment", StaticTask(json!("paid")));

    let record = engine.start("order", json!({})).await.unwrap();
    let trigger = engine.store().pop_trigger().unwrap();
    engine.run_execution(trigger.execution_id).await.unwrap();

    // the transport redelivers the same dispatch twice
    let dispatch = engine.store().pop_task().unwrap();
    engine.run_task(dispatch.clone()).await.unwrap();
    engine.run_task(dispatch).await.unwrap();

    let completions = engine
        .store()
        .load_history(record.id)
        .await
        .unwrap()
        .iter()
        .filter(|event| matches!(event.payload, EventPayload::TaskCompleted { .. }))
        .count();
    assert_eq!(completions, 1);

    testing::drain(&engine).await.unwrap();
    let record = testing::refreshed(&engine, record.id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.cursor_index, 1);
}

#[tokio::test]
async fn test_retry_schedule_follows_exponential_backoff() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .step(
                StepDefinition::task("charge", "charge_payment").with_retry(
                    RetryPolicy::new(3)
                        .with_initial_delay(std::time::Duration::from_secs(2))
                        .with_backoff(Backoff::Exponential),
                ),
            )
            .build()
            .unwrap(),
    );
    engine.register_task("charge_payment", FailingTask("card declined"));

    let record = engine.start("order", json!({})).await.unwrap();

    // attempt 1: immediate
    let trigger = engine.store().pop_trigger().unwrap();
    engine.run_execution(trigger.execution_id).await.unwrap();
    let first = engine.store().pop_task().unwrap();
    assert_eq!(first.headers.attempt, 1);
    assert!(first.run_at.is_none());
    let key = first.headers.idempotency_key.clone();
    engine.run_task(first).await.unwrap();

    // attempt 1 failed but retryable; execution stays running
    let record_after_first = testing::refreshed(&engine, record.id).await.unwrap();
    assert_eq!(record_after_first.state, ExecutionState::Running);

    // attempt 2: +2s
    let before = Utc::now();
    let trigger = engine.store().pop_trigger().unwrap();
    engine.run_execution(trigger.execution_id).await.unwrap();
    let second = engine.store().pop_task().unwrap();
    assert_eq!(second.headers.attempt, 2);
    assert_eq!(second.headers.idempotency_key, key);
    let run_at = second.run_at.unwrap();
    let delay = (run_at - before).num_milliseconds();
    assert!((1900..=2200).contains(&delay), "delay was {delay}ms");
    engine.run_task(second).await.unwrap();

    // attempt 3: +4s, final
    let before = Utc::now();
    let trigger = engine.store().pop_trigger().unwrap();
    engine.run_execution(trigger.execution_id).await.unwrap();
    let third = engine.store().pop_task().unwrap();
    assert_eq!(third.headers.attempt, 3);
    let delay = (third.run_at.unwrap() - before).num_milliseconds();
    assert!((3900..=4200).contains(&delay), "delay was {delay}ms");
    engine.run_task(third).await.unwrap();

    // attempts exhausted: terminal failure
    let trigger = engine.store().pop_trigger().unwrap();
    engine.run_execution(trigger.execution_id).await.unwrap();
    let record = testing::refreshed(&engine, record.id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Failed);
    assert_eq!(record.last_error.unwrap().message, "card declined");

    let history = engine.store().load_history(record.id).await.unwrap();
    let retryable_flags: Vec<bool> = history
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::TaskFailed { retryable, .. } => Some(*retryable),
            _ => None,
        })
        .collect();
    assert_eq!(retryable_flags, [true, true, false]);
}

#[tokio::test]
async fn test_flaky_task_recovers_with_stable_idempotency_key() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .step(
                StepDefinition::task("charge", "charge_payment")
                    .with_retry(RetryPolicy::new(3)),
            )
            .build()
            .unwrap(),
    );
    engine.register_task("charge_payment", FlakyTask::new(1, json!("paid")));

    let record = testing::start_and_drain(&engine, "order", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["charge"], json!("paid"));

    let history = engine.store().load_history(record.id).await.unwrap();
    let keys: Vec<&str> = history
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::TaskScheduled {
                idempotency_key, ..
            } => Some(idempotency_key.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_duplicate_triggers_record_one_terminal_failure() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .task_step("charge", "charge_payment")
            .build()
            .unwrap(),
    );
    engine.register_task("charge_payment", FailingTask("card declined"));

    let record = testing::start_and_drain(&engine, "order", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Failed);

    // stale redeliveries after the terminal event
    engine.run_execution(record.id).await.unwrap();
    engine.run_execution(record.id).await.unwrap();

    let failures = engine
        .store()
        .load_history(record.id)
        .await
        .unwrap()
        .iter()
        .filter(|event| matches!(event.payload, EventPayload::WorkflowFailed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_compensations_unwind_in_reverse_order_skipping_uncompensated() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("trip")
            .task_step("book_flight", "book_flight")
            .task_step("book_hotel", "book_hotel")
            .task_step("book_car", "book_car")
            .task_step("confirm", "confirm_trip")
            .compensate("book_flight", "cancel_flight")
            .compensate("book_car", "cancel_car")
            .build()
            .unwrap(),
    );
    engine.register_task("book_flight", StaticTask(json!("flight")));
    engine.register_task("book_hotel", StaticTask(json!("hotel")));
    engine.register_task("book_car", StaticTask(json!("car")));
    engine.register_task("confirm_trip", FailingTask("no seats"));
    engine.register_task("cancel_flight", StaticTask(json!("flight cancelled")));
    engine.register_task("cancel_car", StaticTask(json!("car cancelled")));

    let record = testing::start_and_drain(&engine, "trip", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Failed);

    let history = engine.store().load_history(record.id).await.unwrap();
    let scheduled: Vec<(&str, &str)> = history
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::CompensationScheduled { step, task } => {
                Some((step.as_str(), task.as_str()))
            }
            _ => None,
        })
        .collect();
    // reverse declaration order; book_hotel has no compensation
    assert_eq!(
        scheduled,
        [("book_car", "cancel_car"), ("book_flight", "cancel_flight")]
    );

    let completed = history
        .iter()
        .filter(|event| matches!(event.payload, EventPayload::CompensationCompleted { .. }))
        .count();
    assert_eq!(completed, 2);

    // a second failure pass must not reschedule them
    engine.run_execution(record.id).await.unwrap();
    testing::drain(&engine).await.unwrap();
    let rescheduled = engine
        .store()
        .load_history(record.id)
        .await
        .unwrap()
        .iter()
        .filter(|event| matches!(event.payload, EventPayload::CompensationScheduled { .. }))
        .count();
    assert_eq!(rescheduled, 2);
}

#[tokio::test]
async fn test_cancellation_compensates_completed_steps() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("order")
            .task_step("reserve", "reserve_inventory")
            .inline_step("review", |_| Err(StepFailure::cancelled("fraud check")))
            .compensate("reserve", "release_inventory")
            .build()
            .unwrap(),
    );
    engine.register_task("reserve_inventory", StaticTask(json!("held")));
    engine.register_task("release_inventory", StaticTask(json!("released")));

    let record = testing::start_and_drain(&engine, "order", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Cancelled);

    let history = engine.store().load_history(record.id).await.unwrap();
    assert!(history.iter().any(|event| matches!(
        &event.payload,
        EventPayload::WorkflowCancelled { reason, .. } if reason == "fraud check"
    )));
    assert!(history.iter().any(|event| matches!(
        &event.payload,
        EventPayload::CompensationCompleted { step, .. } if step == "reserve"
    )));
}

#[tokio::test]
async fn test_timer_suspension_and_resumption() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("reminder")
            .inline_step("pause", |scope| {
                scope.wait().sleep_for(std::time::Duration::ZERO);
                Ok(json!("rested"))
            })
            .inline_step("send", |_| Ok(json!("sent")))
            .build()
            .unwrap(),
    );

    let record = testing::start_and_drain(&engine, "reminder", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["pause"], json!("rested"));
    assert_eq!(
        event_types(&engine, record.id).await,
        [
            "workflow_started",
            "step_waiting",
            "timer_scheduled",
            "timer_fired",
            "step_completed",
            "step_completed",
            "workflow_completed",
        ]
    );
}

#[tokio::test]
async fn test_future_timer_leaves_execution_suspended() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("reminder")
            .inline_step("pause", |scope| {
                scope.wait().sleep_for(std::time::Duration::from_secs(3600));
                Ok(json!(null))
            })
            .build()
            .unwrap(),
    );

    let record = testing::start_and_drain(&engine, "reminder", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Running);

    let timers = engine.store().timers_for(record.id);
    assert_eq!(timers.len(), 1);
    assert!(timers[0].run_at > Utc::now());
}

#[tokio::test]
async fn test_signal_received_before_wait_is_buffered_then_consumed() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("approval_flow")
            .inline_step("collect", |scope| {
                if scope.get("approval").is_none() {
                    scope.wait().for_signal("approval");
                }
                Ok(json!("collected"))
            })
            .signal("approval")
            .build()
            .unwrap(),
    );

    let record = engine.start("approval_flow", json!({})).await.unwrap();
    // signal lands before the execution ever suspends
    engine
        .signal(record.id, "approval", json!({"approved": true}))
        .await
        .unwrap();

    testing::drain(&engine).await.unwrap();
    let record = testing::refreshed(&engine, record.id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["approval"], json!({"approved": true}));

    let history = engine.store().load_history(record.id).await.unwrap();
    assert!(history
        .iter()
        .any(|event| matches!(event.payload, EventPayload::SignalConsumed { .. })));
}

#[tokio::test]
async fn test_signal_handler_mutates_context() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("approval_flow")
            .inline_step("collect", |scope| {
                if scope.get("decision").is_none() {
                    scope.wait().for_signal("approval");
                }
                Ok(scope.get("decision").cloned().unwrap_or_default())
            })
            .on_signal("approval", |ctx, payload| {
                ctx.insert("decision".into(), payload["decision"].clone());
            })
            .build()
            .unwrap(),
    );

    let record = testing::start_and_drain(&engine, "approval_flow", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Running);

    engine
        .signal(record.id, "approval", json!({"decision": "approved"}))
        .await
        .unwrap();
    testing::drain(&engine).await.unwrap();

    let record = testing::refreshed(&engine, record.id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["collect"], json!("approved"));
}

#[tokio::test]
async fn test_notifications_for_a_full_run() {
    use sagaflow_engine::observe::events;

    let notifier = Arc::new(RecordingNotifier::new());
    let engine = Engine::new(MemoryStore::new()).with_notifier(notifier.clone());
    engine.register_workflow(
        Graph::builder("order")
            .task_step("charge", "charge_payment")
            .inline_step("confirm", |_| Ok(json!("ok")))
            .build()
            .unwrap(),
    );
    engine.register_task("charge_payment", StaticTask(json!("paid")));

    testing::start_and_drain(&engine, "order", json!({})).await.unwrap();

    assert_eq!(notifier.count(events::EXECUTION_STARTED), 1);
    assert_eq!(notifier.count(events::TASK_SCHEDULED), 1);
    assert_eq!(notifier.count(events::TASK_COMPLETED), 1);
    assert_eq!(notifier.count(events::STEP_COMPLETED), 1);
    assert_eq!(notifier.count(events::EXECUTION_COMPLETED), 1);
    assert_eq!(notifier.count(events::EXECUTION_FAILED), 0);
}

#[tokio::test]
async fn test_derived_arguments_and_mixed_step_kinds() {
    let engine = Engine::new(MemoryStore::new());
    engine.register_workflow(
        Graph::builder("invoice")
            .inline_step("total", |scope| {
                scope.set("amount", json!(250));
                Ok(json!(250))
            })
            .step(
                StepDefinition::task("bill", "bill_customer").with_arguments(TaskArgs::Derive(
                    Arc::new(|view: &sagaflow_engine::WorkflowView<'_>| {
                        json!({"cents": view.ctx["amount"].as_i64().unwrap_or(0) * 100})
                    }),
                )),
            )
            .build()
            .unwrap(),
    );

    struct EchoArgs;
    #[async_trait]
    impl Task for EchoArgs {
        async fn perform(&self, _ctx: &TaskContext, arguments: Value) -> Result<Value, TaskError> {
            Ok(arguments)
        }
    }
    engine.register_task("bill_customer", EchoArgs);

    let record = testing::start_and_drain(&engine, "invoice", json!({}))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.ctx["bill"], json!({"cents": 25000}));

    let graph = engine.graphs().get("invoice").unwrap();
    assert!(matches!(graph.steps()[0].kind, StepKind::Inline(_)));
    assert!(matches!(graph.steps()[1].kind, StepKind::Task(_)));
}
