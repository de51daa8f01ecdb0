//! Retry, backoff and retention settings of a queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::QueueName;

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`.
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay after the `attempt`-th failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed, the first one included.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Backoff::None)
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker slots per job kind on this queue.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Completed jobs kept for inspection; older ones are evicted first.
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 1,
            backoff: Backoff::None,
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff)
    }

    /// Built-in settings of each named queue.
    pub fn defaults_for(name: QueueName) -> Self {
        match name {
            QueueName::TestExecution => Self {
                concurrency: 5,
                max_attempts: 3,
                backoff: Backoff::Exponential { delay_ms: 2000 },
                keep_completed: 100,
                keep_failed: 50,
            },
            QueueName::Monitoring => Self {
                concurrency: 10,
                max_attempts: 2,
                backoff: Backoff::Fixed { delay_ms: 1000 },
                keep_completed: 50,
                keep_failed: 25,
            },
            QueueName::Notifications => Self {
                concurrency: 3,
                max_attempts: 5,
                backoff: Backoff::Exponential { delay_ms: 1000 },
                keep_completed: 25,
                keep_failed: 10,
            },
            QueueName::Analytics => Self {
                concurrency: 2,
                max_attempts: 1,
                backoff: Backoff::None,
                keep_completed: 200,
                keep_failed: 50,
            },
        }
    }
}
