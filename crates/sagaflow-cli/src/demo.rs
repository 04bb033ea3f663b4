//! Bundled demo workflows and tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sagaflow_engine::observe::Notifier;
use sagaflow_engine::prelude::*;
use sagaflow_engine::IdempotencyKey;

/// Simulated worker task returning a canned result
struct Simulated {
    result: Value,
    fail_when: Option<&'static str>,
}

impl Simulated {
    fn ok(result: Value) -> Self {
        Self {
            result,
            fail_when: None,
        }
    }

    /// Fails when the arguments carry a truthy field of this name
    fn failing_on(result: Value, field: &'static str) -> Self {
        Self {
            result,
            fail_when: Some(field),
        }
    }
}

#[async_trait]
impl Task for Simulated {
    async fn perform(&self, ctx: &TaskContext, arguments: Value) -> Result<Value, TaskError> {
        if let Some(field) = self.fail_when {
            if arguments.get(field).is_some_and(|v| v.as_bool() == Some(true)) {
                return Err(TaskError::new(format!(
                    "simulated failure in `{}`",
                    ctx.step_name
                ))
                .with_class("SimulatedFailure"));
            }
        }
        Ok(self.result.clone())
    }
}

/// Build the demo engine: an order fulfillment saga and a reminder
/// workflow, wired to an in-memory store.
pub fn build_engine(notifier: Arc<dyn Notifier>) -> Result<Engine<MemoryStore>, EngineError> {
    let engine = Engine::new(MemoryStore::new()).with_notifier(notifier);

    let order = Graph::builder("order_fulfillment")
        .step(
            StepDefinition::task("reserve", "reserve_inventory")
                .with_idempotency_key(IdempotencyKey::ContextField("order_id".into())),
        )
        .step(
            StepDefinition::task("charge", "charge_payment").with_retry(
                RetryPolicy::new(3)
                    .with_initial_delay(Duration::from_secs(2))
                    .with_backoff(Backoff::Exponential),
            ),
        )
        .inline_step("approval", |scope| {
            if scope.get("approval").is_none() {
                scope.wait().for_signal("approval");
            }
            Ok(scope.get("approval").cloned().unwrap_or(json!(null)))
        })
        .inline_step("confirm", |scope| {
            let charge = scope.get("charge").cloned().unwrap_or_default();
            scope.set("confirmation", json!({"charge": charge}));
            Ok(json!("confirmed"))
        })
        .signal("approval")
        .query("progress", |state| {
            json!({
                "completed_steps": state.summary.completed_steps,
                "cursor": state.cursor_step,
                "finished": state.is_finished(),
            })
        })
        .compensate("reserve", "release_inventory")
        .compensate("charge", "refund_payment")
        .build()?;
    engine.register_workflow(order);

    let reminder = Graph::builder("reminder")
        .inline_step("pause", |scope| {
            scope.wait().sleep_for(Duration::ZERO);
            Ok(json!("waited"))
        })
        .task_step("send", "send_reminder")
        .build()?;
    engine.register_workflow(reminder);

    engine.register_task(
        "reserve_inventory",
        Simulated::ok(json!({"reservation": "res-1189"})),
    );
    engine.register_task(
        "charge_payment",
        Simulated::failing_on(json!({"charge": "ch-2041"}), "fail_charge"),
    );
    engine.register_task("release_inventory", Simulated::ok(json!("released")));
    engine.register_task("refund_payment", Simulated::ok(json!("refunded")));
    engine.register_task("send_reminder", Simulated::ok(json!("sent")));

    Ok(engine)
}

pub fn workflow_names() -> &'static [&'static str] {
    &["order_fulfillment", "reminder"]
}
