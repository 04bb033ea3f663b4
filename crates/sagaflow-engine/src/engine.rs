//! Engine facade: registration plus the start/signal/query surface.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::{signature, Graph, GraphRegistry, TaskRegistry};
use crate::jobs;
use crate::observe::{events, Notifier, TracingNotifier};
use crate::runner::{RunOutcome, Runner};
use crate::store::{ExecutionRecord, Store, StoreError, TaskDispatch};
use crate::task::Task;
use crate::Context;

/// Wires a store to workflow and task registries.
///
/// One engine per process; registrations happen at startup. Cheap to
/// share: all state is behind `Arc`s.
pub struct Engine<S: Store> {
    store: Arc<S>,
    graphs: Arc<GraphRegistry>,
    tasks: Arc<TaskRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            graphs: Arc::clone(&self.graphs),
            tasks: Arc::clone(&self.tasks),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            graphs: Arc::new(GraphRegistry::new()),
            tasks: Arc::new(TaskRegistry::new()),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    pub fn register_workflow(&self, graph: Graph) {
        self.graphs.register(graph);
    }

    pub fn register_task(&self, name: impl Into<String>, task: impl Task + 'static) {
        self.tasks.register(name, task);
    }

    /// A runner bound to this engine's store and registries
    pub fn runner(&self) -> Runner<S> {
        Runner::new(Arc::clone(&self.store), Arc::clone(&self.graphs))
            .with_notifier(Arc::clone(&self.notifier))
    }

    /// Start an execution of a registered workflow. The input must be
    /// a JSON object; it seeds the workflow context.
    #[tracing::instrument(skip(self, input), fields(workflow = %workflow))]
    pub async fn start(
        &self,
        workflow: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionRecord, EngineError> {
        let graph = self.graphs.get(workflow)?;
        let input: Context = match input {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Context::new(),
            _ => {
                return Err(EngineError::Configuration(
                    "workflow input must be a JSON object".into(),
                ))
            }
        };
        let sig = signature::signature(&graph);
        let record = self.store.start_execution(&graph, input, sig).await?;
        self.notifier.notify(
            events::EXECUTION_STARTED,
            json!({"execution_id": record.id, "workflow": workflow}),
        );
        tracing::info!(execution_id = %record.id, "execution started");
        Ok(record)
    }

    /// Deliver a signal. Fails fast on unknown executions and on
    /// signal names the workflow never declared; accepted signals are
    /// buffered until a run consumes them.
    #[tracing::instrument(skip(self, payload), fields(execution_id = %execution_id, signal = %signal))]
    pub async fn signal(
        &self,
        execution_id: Uuid,
        signal: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        let record = match self.store.get_execution(execution_id).await {
            Ok(record) => record,
            Err(StoreError::ExecutionNotFound(id)) => {
                return Err(EngineError::ExecutionNotFound(id))
            }
            Err(other) => return Err(other.into()),
        };
        let graph = self.graphs.get(&record.workflow)?;
        if !graph.signal_defined(signal) {
            return Err(EngineError::UnknownSignal(signal.to_owned()));
        }
        self.store
            .signal_execution(execution_id, signal, payload)
            .await?;
        self.notifier.notify(
            events::SIGNAL_RECEIVED,
            json!({"execution_id": execution_id, "signal": signal}),
        );
        Ok(())
    }

    /// Run a named query against the execution's replayed state.
    /// Read-only: no lock, no events, no side effects.
    pub async fn query(
        &self,
        execution_id: Uuid,
        query: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let record = match self.store.get_execution(execution_id).await {
            Ok(record) => record,
            Err(StoreError::ExecutionNotFound(id)) => {
                return Err(EngineError::ExecutionNotFound(id))
            }
            Err(other) => return Err(other.into()),
        };
        let graph = self.graphs.get(&record.workflow)?;
        let handler = graph
            .query_handler(query)
            .ok_or_else(|| EngineError::UnknownQuery(query.to_owned()))?;
        Ok(self
            .store
            .query_execution(&graph, execution_id, handler)
            .await?)
    }

    /// Run one runner pass for a queued trigger
    pub async fn run_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<RunOutcome>, EngineError> {
        jobs::run_execution(&self.runner(), execution_id).await
    }

    /// Execute one task dispatch
    pub async fn run_task(&self, dispatch: TaskDispatch) -> Result<(), EngineError> {
        jobs::run_task(
            self.store.as_ref(),
            &self.graphs,
            &self.tasks,
            self.notifier.as_ref(),
            dispatch,
        )
        .await
    }

    /// Fire due timers
    pub async fn sweep_timers(&self, batch_size: usize) -> Result<usize, EngineError> {
        jobs::sweep_timers(self.store.as_ref(), self.notifier.as_ref(), batch_size).await
    }
}
