//! Determinism signature over a workflow's structure.
//!
//! The signature is a SHA-256 hex digest of a canonical JSON document
//! covering everything that affects replay: ordered steps with their
//! kind, retry, timeouts and options, plus sorted signal, query and
//! compensation declarations. It deliberately excludes code inside
//! bodies and handlers. An execution records the signature at start;
//! every later run asserts it before appending any event, so drifted
//! workflow code fails closed instead of replaying incorrectly.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::graph::{Graph, StepKind};
use crate::retry::RetryPolicy;
use crate::Timeouts;

#[derive(Serialize)]
struct GraphDigest<'a> {
    workflow: &'a str,
    steps: Vec<StepDigest<'a>>,
    signals: Vec<&'a str>,
    queries: Vec<&'a str>,
    compensations: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct StepDigest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline: Option<bool>,
    retry: RetryPolicy,
    timeouts: Timeouts,
    options: &'a BTreeMap<String, serde_json::Value>,
}

/// Compute the graph's determinism signature (lowercase hex).
pub fn signature(graph: &Graph) -> String {
    let digest = GraphDigest {
        workflow: graph.name(),
        steps: graph
            .steps()
            .iter()
            .map(|step| StepDigest {
                name: &step.name,
                task: step.task_name(),
                inline: matches!(step.kind, StepKind::Inline(_)).then_some(true),
                retry: step.retry_policy(),
                timeouts: step.timeouts.clone().unwrap_or_default(),
                options: &step.options,
            })
            .collect(),
        signals: graph.signal_names().collect(),
        queries: graph.query_names().collect(),
        compensations: graph
            .compensations()
            .iter()
            .map(|(step, task)| (step.as_str(), task.as_str()))
            .collect(),
    };
    // BTreeMap keys and the sorted name iterators make the JSON canonical
    let canonical = serde_json::to_string(&digest).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hex::encode(hasher.finalize())
}

/// Assert the current graph still matches the signature an execution
/// was started with. Runs before any event is appended; a mismatch is
/// fatal to the run and leaves the execution untouched.
pub fn assert_signature(graph: &Graph, persisted: Option<&str>) -> Result<String, EngineError> {
    let actual = signature(graph);
    match persisted {
        Some(expected) if expected != actual => Err(EngineError::Determinism {
            expected: expected.to_owned(),
            actual,
        }),
        _ => Ok(actual),
    }
}
