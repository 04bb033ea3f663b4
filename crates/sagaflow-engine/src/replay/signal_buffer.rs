//! Buffered signals reconstructed during replay.
//!
//! Signals are never lost: an arrival is recorded whether or not the
//! execution is waiting for it, and stays buffered until a run
//! consumes it. Consumption is oldest-first per signal name.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One buffered signal arrival
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRecord {
    pub signal: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Signal arrivals in order, with consumption tracking
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalBuffer {
    records: Vec<SignalRecord>,
}

impl SignalBuffer {
    pub fn push(
        &mut self,
        signal: impl Into<String>,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        received_at: DateTime<Utc>,
    ) {
        self.records.push(SignalRecord {
            signal: signal.into(),
            payload,
            metadata,
            received_at,
            consumed: false,
        });
    }

    /// Mark the oldest unconsumed arrival of `signal` as consumed
    pub fn consume(&mut self, signal: &str) -> Option<&SignalRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.signal == signal && !record.consumed)?;
        record.consumed = true;
        Some(record)
    }

    /// Unconsumed arrivals, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &SignalRecord> {
        self.records.iter().filter(|record| !record.consumed)
    }

    pub fn pending_for<'a>(
        &'a self,
        signal: &'a str,
    ) -> impl Iterator<Item = &'a SignalRecord> + 'a {
        self.pending().filter(move |record| record.signal == signal)
    }

    pub fn has_pending(&self, signal: &str) -> bool {
        self.pending_for(signal).next().is_some()
    }

    pub fn consumed_count(&self, signal: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.signal == signal && record.consumed)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
