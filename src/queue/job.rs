//! Jobs, their typed payloads and handles.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::{JobKind, QueueName, QueueStats, RetryPolicy};
use crate::detect::AlertBreach;
use crate::error::ValidationError;
use crate::model::{Region, TriggerSource};
use crate::system::SystemSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Payload of a `run-test` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestPayload {
    pub test_id: String,
    #[serde(default)]
    pub triggered_by: TriggerSource,
    /// Empty means the test's own regions.
    #[serde(default)]
    pub regions: Vec<Region>,
}

/// Payload of a `health-check` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    pub url: String,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_health_timeout_ms() -> u64 {
    10_000
}

/// Payload of a `send-notification` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    Alert(AlertBreach),
}

/// Payload of a `calculate-metrics` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub collected_at: DateTime<Utc>,
    pub system: SystemSnapshot,
    #[serde(default)]
    pub queues: BTreeMap<QueueName, QueueStats>,
}

/// Job payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    RunTest(RunTestPayload),
    HealthCheck(HealthCheckPayload),
    SendNotification(NotificationPayload),
    CalculateMetrics(MetricsPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::RunTest(_) => JobKind::RunTest,
            JobPayload::HealthCheck(_) => JobKind::HealthCheck,
            JobPayload::SendNotification(_) => JobKind::SendNotification,
            JobPayload::CalculateMetrics(_) => JobKind::CalculateMetrics,
        }
    }

    /// Decode an untyped payload for `kind`.
    pub fn from_json(kind: JobKind, data: serde_json::Value) -> Result<Self, ValidationError> {
        let malformed = |e: serde_json::Error| ValidationError::Malformed(e.to_string());
        Ok(match kind {
            JobKind::RunTest => JobPayload::RunTest(serde_json::from_value(data).map_err(malformed)?),
            JobKind::HealthCheck => {
                JobPayload::HealthCheck(serde_json::from_value(data).map_err(malformed)?)
            }
            JobKind::SendNotification => {
                JobPayload::SendNotification(serde_json::from_value(data).map_err(malformed)?)
            }
            JobKind::CalculateMetrics => {
                JobPayload::CalculateMetrics(serde_json::from_value(data).map_err(malformed)?)
            }
        })
    }

    /// Checks run before a job is admitted.
    pub fn validate(&self, queue: QueueName) -> Result<(), ValidationError> {
        let kind = self.kind();
        if kind.queue() != queue {
            return Err(ValidationError::WrongQueue { kind, queue });
        }
        match self {
            JobPayload::RunTest(p) if p.test_id.trim().is_empty() => {
                Err(ValidationError::EmptyTestId)
            }
            JobPayload::HealthCheck(p) if p.url.trim().is_empty() => {
                Err(ValidationError::EmptyField { field: "url" })
            }
            JobPayload::SendNotification(NotificationPayload::Alert(a))
                if a.project_id.trim().is_empty() =>
            {
                Err(ValidationError::EmptyField {
                    field: "project_id",
                })
            }
            _ => Ok(()),
        }
    }
}

/// Snapshot of a job as seen by handlers and operators.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    /// Invocations started so far, the current one included.
    pub attempts_made: u32,
    pub retry: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
}

impl Job {
    /// Retries already spent before the current attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts_made.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Admit the job as `delayed` and release it after this long.
    pub delay: Option<Duration>,
    /// Replaces the queue's retry policy for this job.
    pub retry: Option<RetryPolicy>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            retry: Some(retry),
            ..Self::default()
        }
    }
}

/// Returned by `enqueue`; observes the job's state.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: QueueName,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub(crate) fn new(id: Uuid, queue: QueueName, state: watch::Receiver<JobState>) -> Self {
        Self { id, queue, state }
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait until the job completes or fails. If the job is removed or
    /// evicted first, the last observed state is returned.
    pub async fn wait(mut self) -> JobState {
        loop {
            let current = *self.state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_test_payload_wire_shape() {
        let payload: RunTestPayload = serde_json::from_value(serde_json::json!({
            "testId": "t-42",
            "triggeredBy": "webhook",
            "regions": ["eu-west-1"]
        }))
        .unwrap();
        assert_eq!(payload.test_id, "t-42");
        assert_eq!(payload.triggered_by, TriggerSource::Webhook);
        assert_eq!(payload.regions, vec![Region::EuWest1]);
    }

    #[test]
    fn test_validation_rejects_wrong_queue_and_empty_id() {
        let payload = JobPayload::RunTest(RunTestPayload {
            test_id: "t1".into(),
            triggered_by: TriggerSource::Api,
            regions: Vec::new(),
        });
        assert!(payload.validate(QueueName::TestExecution).is_ok());
        assert!(matches!(
            payload.validate(QueueName::Analytics),
            Err(ValidationError::WrongQueue { .. })
        ));

        let empty = JobPayload::RunTest(RunTestPayload {
            test_id: "  ".into(),
            triggered_by: TriggerSource::Api,
            regions: Vec::new(),
        });
        assert!(matches!(
            empty.validate(QueueName::TestExecution),
            Err(ValidationError::EmptyTestId)
        ));
    }

    #[test]
    fn test_from_json_reports_malformed() {
        let err = JobPayload::from_json(JobKind::HealthCheck, serde_json::json!({"timeout_ms": 5}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));

        let ok = JobPayload::from_json(
            JobKind::HealthCheck,
            serde_json::json!({"url": "http://localhost/health"}),
        )
        .unwrap();
        assert_eq!(ok.kind(), JobKind::HealthCheck);
    }

    #[tokio::test]
    async fn test_handle_wait_returns_terminal_state() {
        let (tx, rx) = watch::channel(JobState::Waiting);
        let handle = JobHandle::new(Uuid::new_v4(), QueueName::Monitoring, rx);
        let waiter = tokio::spawn(handle.wait());
        tx.send_replace(JobState::Active);
        tx.send_replace(JobState::Completed);
        assert_eq!(waiter.await.unwrap(), JobState::Completed);
    }
}
