//! Retry policies for delegated task steps

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy between task attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Constant,
    /// Delay doubles with each subsequent retry
    Exponential,
}

/// Retry policy for a delegated task step.
///
/// Attempt numbering is 1-based. The first attempt always runs
/// immediately; `initial_delay` applies from the second attempt on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,

    /// Base delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Growth strategy for subsequent delays
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff: Backoff::Constant,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt ceiling
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Set the base delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff strategy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before attempt `n` (1-based). Attempt 1 is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Constant => self.initial_delay,
            Backoff::Exponential => {
                let exponent = (attempt - 2).min(63);
                self.initial_delay
                    .checked_mul(1u32 << exponent.min(31))
                    .unwrap_or(Duration::MAX)
            }
        }
    }

    /// Wall-clock time at which attempt `n` should run, or `None`
    /// when it should run immediately.
    pub fn schedule_at(&self, attempt: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempt <= 1 {
            return None;
        }
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return None;
        }
        let millis = delay.as_millis().min(i64::MAX as u128) as i64;
        Some(now + chrono::Duration::milliseconds(millis))
    }
}

/// Serde helpers for durations as integer milliseconds
pub(crate) mod duration_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helpers for optional durations as integer milliseconds
pub(crate) mod option_duration_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
