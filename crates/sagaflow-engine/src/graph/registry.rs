//! Name-keyed registries for workflow graphs and task implementations

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::EngineError;
use crate::graph::Graph;
use crate::task::Task;

/// Registry of workflow graphs, keyed by workflow name.
///
/// Registration happens at startup; lookups during runs fail with a
/// configuration error for unknown names.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph under its workflow name, replacing any previous
    /// registration.
    pub fn register(&self, graph: Graph) -> Arc<Graph> {
        let graph = Arc::new(graph);
        self.graphs
            .write()
            .insert(graph.name().to_owned(), Arc::clone(&graph));
        graph
    }

    pub fn get(&self, name: &str) -> Result<Arc<Graph>, EngineError> {
        self.graphs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("workflow `{name}` is not registered")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graphs.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.graphs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.read().is_empty()
    }
}

impl std::fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRegistry")
            .field("workflows", &self.names())
            .finish()
    }
}

/// Registry of task implementations, keyed by task name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, task: impl Task + 'static) {
        self.tasks.write().insert(name.into(), Arc::new(task));
    }

    pub fn register_arc(&self, name: impl Into<String>, task: Arc<dyn Task>) {
        self.tasks.write().insert(name.into(), task);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Task>, EngineError> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("task `{name}` is not registered")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
