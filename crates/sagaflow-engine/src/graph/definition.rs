//! Workflow graph definitions.
//!
//! A workflow is declared explicitly as an ordered list of steps plus
//! signal, query, and compensation declarations, built through
//! [`GraphBuilder`]. Declaration order is execution order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, ErrorInfo};
use crate::idempotency::IdempotencyKey;
use crate::replay::State;
use crate::retry::{option_duration_millis, RetryPolicy};
use crate::wait::WaitContext;
use crate::Context;

/// Inline step body: runs in-process under the execution lock.
pub type StepBody =
    Arc<dyn Fn(&mut StepScope<'_>) -> Result<serde_json::Value, StepFailure> + Send + Sync>;

/// Signal handler: mutates the context when a buffered signal is consumed.
pub type SignalHandler = Arc<dyn Fn(&mut Context, &serde_json::Value) + Send + Sync>;

/// Query handler: pure read over replayed state.
pub type QueryHandler = Arc<dyn Fn(&State) -> serde_json::Value + Send + Sync>;

/// Computes task arguments from the execution at scheduling time.
pub type ArgumentsFn = Arc<dyn Fn(&WorkflowView<'_>) -> serde_json::Value + Send + Sync>;

/// Read-only view of an execution handed to key and argument closures.
pub struct WorkflowView<'a> {
    pub execution_id: Uuid,
    pub workflow: &'a str,
    pub ctx: &'a Context,
    pub metadata: &'a serde_json::Value,
}

/// Failure raised by an inline step body
#[derive(Debug, Clone)]
pub enum StepFailure {
    /// Cooperative cancellation; closes the execution as cancelled
    Cancelled { reason: String },
    /// Fault; closes the execution as failed
    Error(ErrorInfo),
}

impl StepFailure {
    pub fn error(message: impl Into<String>) -> Self {
        StepFailure::Error(ErrorInfo::new(message))
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        StepFailure::Cancelled {
            reason: reason.into(),
        }
    }
}

impl From<ErrorInfo> for StepFailure {
    fn from(error: ErrorInfo) -> Self {
        StepFailure::Error(error)
    }
}

impl From<serde_json::Error> for StepFailure {
    fn from(error: serde_json::Error) -> Self {
        StepFailure::Error(ErrorInfo::new(error.to_string()).with_class("serde_json::Error"))
    }
}

/// Mutable scope handed to an inline step body while it runs.
pub struct StepScope<'a> {
    pub execution_id: Uuid,
    pub workflow: &'a str,
    pub metadata: &'a serde_json::Value,
    /// Accumulated workflow context; persisted when the step completes
    pub ctx: &'a mut Context,
    pub(crate) wait: &'a mut WaitContext,
}

impl<'a> StepScope<'a> {
    /// Suspension collector: declaring any wait suspends this run
    pub fn wait(&mut self) -> &mut WaitContext {
        self.wait
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.ctx.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.ctx.insert(key.into(), value);
    }
}

/// How a step executes
#[derive(Clone)]
pub enum StepKind {
    /// Body runs in-process inside the runner, under the lock
    Inline(StepBody),
    /// Execution delegated to the named task, out of process
    Task(String),
}

impl StepKind {
    pub fn is_task(&self) -> bool {
        matches!(self, StepKind::Task(_))
    }

    pub fn task_name(&self) -> Option<&str> {
        match self {
            StepKind::Task(name) => Some(name),
            StepKind::Inline(_) => None,
        }
    }
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Inline(_) => write!(f, "Inline(..)"),
            StepKind::Task(name) => f.debug_tuple("Task").field(name).finish(),
        }
    }
}

/// Timeout bounds for a delegated task step.
///
/// Recorded in the determinism signature; enforcement belongs to the
/// job transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Max time between scheduling and pickup
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_start: Option<Duration>,

    /// Max time for one attempt to run
    #[serde(default, with = "option_duration_millis")]
    pub start_to_close: Option<Duration>,
}

impl Timeouts {
    pub fn with_schedule_to_start(mut self, timeout: Duration) -> Self {
        self.schedule_to_start = Some(timeout);
        self
    }

    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = Some(timeout);
        self
    }
}

/// Arguments passed to a delegated task attempt
#[derive(Clone, Default)]
pub enum TaskArgs {
    /// The full workflow context at scheduling time
    #[default]
    Context,
    /// A fixed value
    Literal(serde_json::Value),
    /// Computed from the execution at scheduling time
    Derive(ArgumentsFn),
}

impl TaskArgs {
    pub fn resolve(&self, view: &WorkflowView<'_>) -> serde_json::Value {
        match self {
            TaskArgs::Context => serde_json::Value::Object(view.ctx.clone()),
            TaskArgs::Literal(value) => value.clone(),
            TaskArgs::Derive(f) => f(view),
        }
    }
}

impl std::fmt::Debug for TaskArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskArgs::Context => write!(f, "Context"),
            TaskArgs::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            TaskArgs::Derive(_) => write!(f, "Derive(..)"),
        }
    }
}

/// One step in a workflow graph
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    /// None inherits the builder default, resolved at build time
    pub retry: Option<RetryPolicy>,
    pub timeouts: Option<Timeouts>,
    pub idempotency_key: IdempotencyKey,
    pub arguments: TaskArgs,
    /// Free-form options; part of the determinism signature
    pub options: BTreeMap<String, serde_json::Value>,
}

impl StepDefinition {
    /// An inline step running the given body
    pub fn inline<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut StepScope<'_>) -> Result<serde_json::Value, StepFailure>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Inline(Arc::new(body)),
            retry: None,
            timeouts: None,
            idempotency_key: IdempotencyKey::Default,
            arguments: TaskArgs::Context,
            options: BTreeMap::new(),
        }
    }

    /// A step delegated to the named task
    pub fn task(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Task(task.into()),
            retry: None,
            timeouts: None,
            idempotency_key: IdempotencyKey::Default,
            arguments: TaskArgs::Context,
            options: BTreeMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_arguments(mut self, arguments: TaskArgs) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Effective retry policy (single attempt when none declared)
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub fn is_task(&self) -> bool {
        self.kind.is_task()
    }

    pub fn task_name(&self) -> Option<&str> {
        self.kind.task_name()
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .field("idempotency_key", &self.idempotency_key)
            .field("arguments", &self.arguments)
            .field("options", &self.options)
            .finish()
    }
}

/// An immutable workflow definition.
///
/// Built once through [`GraphBuilder`] and registered by name; the
/// runner replays and advances executions against it.
#[derive(Clone)]
pub struct Graph {
    name: String,
    steps: Vec<StepDefinition>,
    signals: BTreeSet<String>,
    signal_handlers: BTreeMap<String, SignalHandler>,
    queries: BTreeMap<String, QueryHandler>,
    compensations: BTreeMap<String, String>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Step at cursor position (0-based declaration order)
    pub fn step_at(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_named(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Declared signal names, sorted
    pub fn signal_names(&self) -> impl Iterator<Item = &str> {
        self.signals.iter().map(String::as_str)
    }

    pub fn signal_defined(&self, name: &str) -> bool {
        self.signals.contains(name)
    }

    pub fn signal_handler(&self, name: &str) -> Option<&SignalHandler> {
        self.signal_handlers.get(name)
    }

    /// Declared query names, sorted
    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }

    pub fn query_handler(&self, name: &str) -> Option<&QueryHandler> {
        self.queries.get(name)
    }

    /// step name → compensating task name
    pub fn compensations(&self) -> &BTreeMap<String, String> {
        &self.compensations
    }

    pub fn compensation_for(&self, step: &str) -> Option<&str> {
        self.compensations.get(step).map(String::as_str)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("signals", &self.signals)
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .field("compensations", &self.compensations)
            .finish()
    }
}

/// Builder for [`Graph`]. Collects declarations and validates at `build`.
pub struct GraphBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    default_retry: Option<RetryPolicy>,
    default_timeouts: Option<Timeouts>,
    signals: BTreeSet<String>,
    signal_handlers: BTreeMap<String, SignalHandler>,
    queries: BTreeMap<String, QueryHandler>,
    compensations: BTreeMap<String, String>,
    errors: Vec<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            default_retry: None,
            default_timeouts: None,
            signals: BTreeSet::new(),
            signal_handlers: BTreeMap::new(),
            queries: BTreeMap::new(),
            compensations: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Retry policy inherited by steps that declare none
    pub fn default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = Some(retry);
        self
    }

    /// Timeouts inherited by steps that declare none
    pub fn default_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.default_timeouts = Some(timeouts);
        self
    }

    /// Append a step; duplicate names are rejected at build time
    pub fn step(mut self, step: StepDefinition) -> Self {
        if self.steps.iter().any(|existing| existing.name == step.name) {
            self.errors
                .push(format!("step `{}` is already defined", step.name));
        } else {
            self.steps.push(step);
        }
        self
    }

    /// Shorthand for an inline step with no overrides
    pub fn inline_step<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut StepScope<'_>) -> Result<serde_json::Value, StepFailure>
            + Send
            + Sync
            + 'static,
    {
        self.step(StepDefinition::inline(name, body))
    }

    /// Shorthand for a delegated task step with no overrides
    pub fn task_step(self, name: impl Into<String>, task: impl Into<String>) -> Self {
        self.step(StepDefinition::task(name, task))
    }

    /// Declare a signal the workflow accepts
    pub fn signal(mut self, name: impl Into<String>) -> Self {
        self.signals.insert(name.into());
        self
    }

    /// Declare a signal with a context-mutating handler
    pub fn on_signal<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Context, &serde_json::Value) + Send + Sync + 'static,
    {
        let name = name.into();
        self.signals.insert(name.clone());
        self.signal_handlers.insert(name, Arc::new(handler));
        self
    }

    /// Declare a named read-only query over replayed state
    pub fn query<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&State) -> serde_json::Value + Send + Sync + 'static,
    {
        self.queries.insert(name.into(), Arc::new(handler));
        self
    }

    /// Declare the compensating task for a step
    pub fn compensate(mut self, step: impl Into<String>, task: impl Into<String>) -> Self {
        self.compensations.insert(step.into(), task.into());
        self
    }

    pub fn build(mut self) -> Result<Graph, EngineError> {
        for (step, _) in &self.compensations {
            if !self.steps.iter().any(|existing| &existing.name == step) {
                self.errors
                    .push(format!("compensation declared for unknown step `{step}`"));
            }
        }
        if !self.errors.is_empty() {
            return Err(EngineError::Configuration(format!(
                "invalid workflow `{}`: {}",
                self.name,
                self.errors.join("; ")
            )));
        }
        let steps = self
            .steps
            .into_iter()
            .map(|mut step| {
                if step.retry.is_none() {
                    step.retry = self.default_retry.clone();
                }
                if step.timeouts.is_none() {
                    step.timeouts = self.default_timeouts.clone();
                }
                step
            })
            .collect();
        Ok(Graph {
            name: self.name,
            steps,
            signals: self.signals,
            signal_handlers: self.signal_handlers,
            queries: self.queries,
            compensations: self.compensations,
        })
    }
}
