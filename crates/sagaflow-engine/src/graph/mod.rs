//! Workflow graphs: explicit step/signal/query/compensation
//! declarations, the determinism signature over them, and the
//! registries the engine resolves names against.

mod definition;
mod registry;
pub mod signature;

pub use definition::{
    ArgumentsFn, Graph, GraphBuilder, QueryHandler, SignalHandler, StepBody, StepDefinition,
    StepFailure, StepKind, StepScope, TaskArgs, Timeouts, WorkflowView,
};
pub use registry::{GraphRegistry, TaskRegistry};
pub use signature::{assert_signature, signature};
