//! Named job queues with bounded concurrency and retry/backoff.
//!
//! Every job kind belongs to exactly one queue. Workers run per
//! (queue, kind) lane: up to the lane's concurrency jobs of that kind are
//! active at once, admitted in FIFO order. A handler error schedules a
//! retry after the policy's backoff until the attempt budget is spent, at
//! which point the job is marked failed for good.

pub mod job;
pub mod manager;
pub mod policy;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use self::job::{
    EnqueueOptions, HealthCheckPayload, Job, JobHandle, JobPayload, JobState, MetricsPayload,
    NotificationPayload, RunTestPayload,
};
pub use self::manager::{QueueManager, QueueStats};
pub use self::policy::{Backoff, QueueConfig, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    TestExecution,
    Monitoring,
    Notifications,
    Analytics,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::TestExecution,
        QueueName::Monitoring,
        QueueName::Notifications,
        QueueName::Analytics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::TestExecution => "test-execution",
            QueueName::Monitoring => "monitoring",
            QueueName::Notifications => "notifications",
            QueueName::Analytics => "analytics",
        }
    }

    /// Job kinds routed to this queue.
    pub fn kinds(self) -> impl Iterator<Item = JobKind> {
        JobKind::ALL.into_iter().filter(move |k| k.queue() == self)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownQueue(s.to_string()))
    }
}

/// The closed set of job types the engine dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RunTest,
    HealthCheck,
    SendNotification,
    CalculateMetrics,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::RunTest,
        JobKind::HealthCheck,
        JobKind::SendNotification,
        JobKind::CalculateMetrics,
    ];

    pub fn queue(self) -> QueueName {
        match self {
            JobKind::RunTest => QueueName::TestExecution,
            JobKind::HealthCheck => QueueName::Monitoring,
            JobKind::SendNotification => QueueName::Notifications,
            JobKind::CalculateMetrics => QueueName::Analytics,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RunTest => "run-test",
            JobKind::HealthCheck => "health-check",
            JobKind::SendNotification => "send-notification",
            JobKind::CalculateMetrics => "calculate-metrics",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::Malformed(format!("unknown job type '{}'", s)))
    }
}

/// Work performed for one job kind.
///
/// An `Err` counts as a failed attempt and is retried per the job's policy.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

/// One handler per job kind. Constructing this is the only way to install
/// handlers on a [`QueueManager`] in bulk, so no kind can be left without one.
#[derive(Clone)]
pub struct Handlers {
    pub run_test: Arc<dyn JobHandler>,
    pub health_check: Arc<dyn JobHandler>,
    pub send_notification: Arc<dyn JobHandler>,
    pub calculate_metrics: Arc<dyn JobHandler>,
}

impl Handlers {
    pub fn for_kind(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        match kind {
            JobKind::RunTest => self.run_test.clone(),
            JobKind::HealthCheck => self.health_check.clone(),
            JobKind::SendNotification => self.send_notification.clone(),
            JobKind::CalculateMetrics => self.calculate_metrics.clone(),
        }
    }
}
