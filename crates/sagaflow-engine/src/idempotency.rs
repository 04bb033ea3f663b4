//! Idempotency keys for delegated task steps.
//!
//! Every scheduled task attempt carries a key; the store refuses to
//! record a second effective completion for the same key, so retried
//! and duplicated attempts collapse to at most one effect.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::graph::WorkflowView;

/// Closure form of a key policy, evaluated against the execution
pub type KeyFn = Arc<dyn Fn(&WorkflowView<'_>) -> String + Send + Sync>;

/// Per-step idempotency key policy
#[derive(Clone, Default)]
pub enum IdempotencyKey {
    /// Hash of execution id and step name; stable across attempts
    #[default]
    Default,
    /// Fixed string used verbatim
    Literal(String),
    /// Values joined with ":" into one key; null parts are skipped
    Parts(Vec<serde_json::Value>),
    /// Value read from the named context field
    ContextField(String),
    /// Computed from the execution at scheduling time
    Derive(KeyFn),
}

impl IdempotencyKey {
    /// Resolve the key for one step of one execution.
    ///
    /// The result is identical for every attempt of the step.
    pub fn evaluate(&self, view: &WorkflowView<'_>, step: &str) -> String {
        match self {
            IdempotencyKey::Default => default_key(view.execution_id, step),
            IdempotencyKey::Literal(key) => key.clone(),
            IdempotencyKey::Parts(parts) => {
                let joined: Vec<String> = parts
                    .iter()
                    .filter(|part| !part.is_null())
                    .map(scalar_to_string)
                    .collect();
                if joined.is_empty() {
                    default_key(view.execution_id, step)
                } else {
                    joined.join(":")
                }
            }
            IdempotencyKey::ContextField(field) => view
                .ctx
                .get(field)
                .filter(|value| !value.is_null())
                .map(scalar_to_string)
                .unwrap_or_else(|| default_key(view.execution_id, step)),
            IdempotencyKey::Derive(f) => f(view),
        }
    }
}

impl std::fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyKey::Default => write!(f, "Default"),
            IdempotencyKey::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            IdempotencyKey::Parts(parts) => f.debug_tuple("Parts").field(parts).finish(),
            IdempotencyKey::ContextField(field) => {
                f.debug_tuple("ContextField").field(field).finish()
            }
            IdempotencyKey::Derive(_) => write!(f, "Derive(..)"),
        }
    }
}

/// Key used when a step declares no policy:
/// sha256("{execution_id}:{step}:0") as lowercase hex.
pub fn default_key(execution_id: Uuid, step: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{execution_id}:{step}:0"));
    hex::encode(hasher.finalize())
}

/// Hash arbitrary parts into a key: sha256 of the "|"-joined strings.
/// Used for internally generated keys such as compensation dispatches.
pub fn digest<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = parts
        .into_iter()
        .map(|part| part.as_ref().to_owned())
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined);
    hex::encode(hasher.finalize())
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
