//! Durable workflow execution engine.
//!
//! Workflows are declared as explicit graphs of steps: inline bodies
//! that run in-process, and tasks delegated to out-of-process workers
//! with per-step retry policies and idempotency keys. Every state
//! transition is an immutable event; executions are advanced by a
//! runner that replays the full log into fresh state, asserts a
//! determinism signature over the graph, and performs exactly one
//! decision per trigger. Executions suspend on timers and signals and
//! unwind through saga-style compensations on failure or cancellation.
//!
//! ```no_run
//! use sagaflow_engine::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), EngineError> {
//! let graph = Graph::builder("order")
//!     .task_step("reserve", "reserve_inventory")
//!     .step(
//!         StepDefinition::task("charge", "charge_payment")
//!             .with_retry(RetryPolicy::new(3)),
//!     )
//!     .compensate("reserve", "release_inventory")
//!     .build()?;
//!
//! let engine = Engine::new(MemoryStore::new());
//! engine.register_workflow(graph);
//! let execution = engine.start("order", json!({"order_id": "ord-1"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod idempotency;
pub mod jobs;
pub mod observe;
pub mod replay;
pub mod retry;
pub mod runner;
pub mod store;
pub mod task;
pub mod testing;
pub mod wait;

/// Workflow context: the accumulating JSON object threaded through an
/// execution's steps.
pub type Context = serde_json::Map<String, serde_json::Value>;

pub use engine::Engine;
pub use error::{EngineError, ErrorInfo};
pub use event::{Event, EventPayload};
pub use graph::{
    Graph, GraphBuilder, GraphRegistry, StepDefinition, StepFailure, StepKind, StepScope,
    TaskArgs, TaskRegistry, Timeouts, WorkflowView,
};
pub use idempotency::IdempotencyKey;
pub use replay::{replay, State};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{RunOutcome, Runner};
pub use store::{
    ExecutionRecord, ExecutionState, MemoryStore, SignalMessage, Store, StoreError, TaskDispatch,
    TaskHeaders, Timer, TriggerReason,
};
pub use task::{Task, TaskContext, TaskError};
pub use wait::{WaitContext, WaitInstruction};

/// Common imports for building and running workflows
pub mod prelude {
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, ErrorInfo};
    pub use crate::graph::{
        Graph, StepDefinition, StepFailure, StepScope, TaskArgs, Timeouts,
    };
    pub use crate::idempotency::IdempotencyKey;
    pub use crate::observe::{Notifier, NullNotifier, TracingNotifier};
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::runner::{RunOutcome, Runner};
    pub use crate::store::{ExecutionState, MemoryStore, Store};
    pub use crate::task::{Task, TaskContext, TaskError};
    pub use crate::Context;
}
