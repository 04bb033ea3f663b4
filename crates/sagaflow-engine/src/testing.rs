//! Deterministic test drivers for the in-memory store.
//!
//! The memory store queues triggers and task dispatches instead of
//! handing them to a real transport; these helpers pump both queues
//! (and the timer sweep) until everything settles, so scenario tests
//! run synchronously with no background workers.

use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::{ExecutionRecord, MemoryStore, Store};

const DEFAULT_MAX_ITERATIONS: usize = 200;

/// Pump queued triggers, task dispatches, and due timers until all
/// queues are empty or the iteration cap is hit.
pub async fn drain(engine: &Engine<MemoryStore>) -> Result<(), EngineError> {
    drain_with_limit(engine, DEFAULT_MAX_ITERATIONS).await
}

pub async fn drain_with_limit(
    engine: &Engine<MemoryStore>,
    max_iterations: usize,
) -> Result<(), EngineError> {
    let store = engine.store();
    for _ in 0..max_iterations {
        engine.sweep_timers(100).await?;
        if let Some(trigger) = store.pop_trigger() {
            engine.run_execution(trigger.execution_id).await?;
            continue;
        }
        if let Some(dispatch) = store.pop_task() {
            engine.run_task(dispatch).await?;
            continue;
        }
        return Ok(());
    }
    Err(EngineError::Configuration(format!(
        "drain did not settle within {max_iterations} iterations"
    )))
}

/// Start an execution, drain everything it produces, and return the
/// refreshed record.
pub async fn start_and_drain(
    engine: &Engine<MemoryStore>,
    workflow: &str,
    input: serde_json::Value,
) -> Result<ExecutionRecord, EngineError> {
    let record = engine.start(workflow, input).await?;
    drain(engine).await?;
    refreshed(engine, record.id).await
}

/// Re-read an execution record
pub async fn refreshed(
    engine: &Engine<MemoryStore>,
    execution_id: Uuid,
) -> Result<ExecutionRecord, EngineError> {
    Ok(engine.store().get_execution(execution_id).await?)
}
