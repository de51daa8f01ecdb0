//! Built-in periodic tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::engine::{PeriodicTask, Scheduler};
use crate::config::SchedulerConfig;
use crate::detect::AlertEvaluator;
use crate::model::TriggerSource;
use crate::queue::{
    EnqueueOptions, JobPayload, MetricsPayload, NotificationPayload, QueueManager, QueueName,
    RunTestPayload,
};
use crate::storage::Store;
use crate::system::SystemSnapshot;

pub const DUE_TEST_SCAN: &str = "due-test-scan";
pub const METRICS_COLLECTION: &str = "metrics-collection";
pub const ALERT_EVALUATION: &str = "alert-evaluation";
pub const RETENTION: &str = "retention";

/// A test is due when a full interval has passed since its reference time.
/// A test that never ran is due immediately.
pub fn is_due(reference: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(reference) = reference else {
        return true;
    };
    match chrono::Duration::from_std(interval) {
        Ok(interval) => now.signed_duration_since(reference) >= interval,
        Err(_) => false,
    }
}

/// Enqueues a scheduled run for every recurring test that is due.
///
/// A lease is taken per test at enqueue time so a test whose run has not
/// finished yet is not enqueued again by the next scan.
pub struct DueTestScan {
    store: Arc<dyn Store>,
    queues: Arc<QueueManager>,
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DueTestScan {
    pub fn new(store: Arc<dyn Store>, queues: Arc<QueueManager>) -> Self {
        Self {
            store,
            queues,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// One scan at `now`; returns how many runs were enqueued.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let tests = self
            .store
            .scheduled_tests()
            .await
            .context("Failed to list scheduled tests")?;

        let mut leases = self.leases.lock().await;
        leases.retain(|id, _| tests.iter().any(|t| &t.id == id));

        let mut enqueued = 0;
        for test in &tests {
            let Some(interval) = test.recurring_interval() else {
                continue;
            };
            let reference = match (test.stats.last_run, leases.get(&test.id).copied()) {
                (Some(run), Some(lease)) => Some(run.max(lease)),
                (run, lease) => run.or(lease),
            };
            if !is_due(reference, interval, now) {
                continue;
            }

            let payload = JobPayload::RunTest(RunTestPayload {
                test_id: test.id.clone(),
                triggered_by: TriggerSource::Scheduled,
                regions: test.regions.clone(),
            });
            match self
                .queues
                .enqueue(QueueName::TestExecution, payload, EnqueueOptions::default())
                .await
            {
                Ok(handle) => {
                    leases.insert(test.id.clone(), now);
                    enqueued += 1;
                    debug!(test = %test.id, job_id = %handle.id, "Scheduled run enqueued");
                }
                Err(e) => warn!(test = %test.id, "Scheduled run not enqueued: {}", e),
            }
        }

        if enqueued > 0 {
            info!(enqueued, scanned = tests.len(), "Due-test scan finished");
        }
        Ok(enqueued)
    }
}

#[async_trait::async_trait]
impl PeriodicTask for DueTestScan {
    async fn tick(&self) -> Result<()> {
        self.scan(Utc::now()).await.map(|_| ())
    }
}

/// Snapshots the host and queues and hands them to the analytics queue.
pub struct MetricsCollection {
    queues: Arc<QueueManager>,
    started: Instant,
}

impl MetricsCollection {
    pub fn new(queues: Arc<QueueManager>, started: Instant) -> Self {
        Self { queues, started }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for MetricsCollection {
    async fn tick(&self) -> Result<()> {
        let uptime = self.started.elapsed().as_secs();
        let system = tokio::task::spawn_blocking(move || SystemSnapshot::capture(uptime))
            .await
            .context("System snapshot task failed")?;
        let payload = JobPayload::CalculateMetrics(MetricsPayload {
            collected_at: Utc::now(),
            system,
            queues: self.queues.all_stats().await,
        });
        self.queues
            .enqueue(QueueName::Analytics, payload, EnqueueOptions::default())
            .await
            .context("Failed to enqueue metrics job")?;
        Ok(())
    }
}

/// Raises one alert notification per breached threshold. Consecutive
/// breaches raise consecutive alerts.
pub struct AlertEvaluation {
    evaluator: AlertEvaluator,
    queues: Arc<QueueManager>,
}

impl AlertEvaluation {
    pub fn new(evaluator: AlertEvaluator, queues: Arc<QueueManager>) -> Self {
        Self { evaluator, queues }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for AlertEvaluation {
    async fn tick(&self) -> Result<()> {
        let breaches = self.evaluator.scan().await?;
        for breach in breaches {
            warn!(
                project = %breach.project_id,
                metric = %breach.metric,
                observed = breach.observed,
                threshold = breach.threshold,
                "Threshold breached"
            );
            let payload = JobPayload::SendNotification(NotificationPayload::Alert(breach));
            self.queues
                .enqueue(QueueName::Notifications, payload, EnqueueOptions::default())
                .await
                .context("Failed to enqueue alert notification")?;
        }
        Ok(())
    }
}

/// Deletes old execution records and finished jobs.
pub struct Retention {
    store: Arc<dyn Store>,
    queues: Arc<QueueManager>,
    execution_max_age: Duration,
    job_max_age: Duration,
}

impl Retention {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<QueueManager>,
        execution_max_age: Duration,
        job_max_age: Duration,
    ) -> Self {
        Self {
            store,
            queues,
            execution_max_age,
            job_max_age,
        }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for Retention {
    async fn tick(&self) -> Result<()> {
        let max_age = chrono::Duration::from_std(self.execution_max_age)
            .context("Execution retention out of range")?;
        if let Some(cutoff) = Utc::now().checked_sub_signed(max_age) {
            let removed = self.store.purge_executions_before(cutoff).await?;
            if removed > 0 {
                info!(removed, cutoff = %cutoff, "Old execution records purged");
            }
        }

        for queue in self.queues.queue_names().await {
            match self.queues.purge_old(queue, self.job_max_age).await {
                Ok(0) => {}
                Ok(purged) => info!(queue = %queue, purged, "Old jobs purged"),
                Err(e) => warn!(queue = %queue, "Job purge failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Register the four built-in tasks on `scheduler`.
pub async fn install_builtin(
    scheduler: &Scheduler,
    config: &SchedulerConfig,
    store: Arc<dyn Store>,
    queues: Arc<QueueManager>,
    started: Instant,
) {
    scheduler
        .register(
            DUE_TEST_SCAN,
            config.due_scan(),
            Arc::new(DueTestScan::new(store.clone(), queues.clone())),
        )
        .await;
    scheduler
        .register(
            METRICS_COLLECTION,
            config.metrics(),
            Arc::new(MetricsCollection::new(queues.clone(), started)),
        )
        .await;
    scheduler
        .register(
            ALERT_EVALUATION,
            config.alert(),
            Arc::new(AlertEvaluation::new(
                AlertEvaluator::new(store.clone(), config.alert_lookback()),
                queues.clone(),
            )),
        )
        .await;
    scheduler
        .register(
            RETENTION,
            config.retention(),
            Arc::new(Retention::new(
                store,
                queues,
                config.execution_retention(),
                config.job_retention(),
            )),
        )
        .await;
}
