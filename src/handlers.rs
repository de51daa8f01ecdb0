//! Job handlers for the closed set of job kinds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::analysis::ResultAggregator;
use crate::detect::AlertEvaluator;
use crate::executor::{TestExecutor, DEFAULT_USER_AGENT};
use crate::model::{ExecutionStatus, HttpMethod, TriggerMetadata};
use crate::notifier::{AlertEvent, Notifier};
use crate::probes::{OutboundRequest, Transport};
use crate::queue::{
    Handlers, Job, JobHandler, JobPayload, MetricsPayload, NotificationPayload,
};
use crate::storage::Store;

/// Runs a stored test across its regions and folds the batch into its stats.
pub struct RunTestHandler {
    store: Arc<dyn Store>,
    executor: TestExecutor,
    aggregator: ResultAggregator,
}

impl RunTestHandler {
    pub fn new(store: Arc<dyn Store>, executor: TestExecutor) -> Self {
        Self {
            aggregator: ResultAggregator::new(store.clone()),
            store,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for RunTestHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::RunTest(payload) = &job.payload else {
            bail!("run-test handler received a {} job", job.kind);
        };

        let mut test = self
            .store
            .get_test(&payload.test_id)
            .await
            .with_context(|| format!("Failed to load test {}", payload.test_id))?
            .ok_or_else(|| anyhow!("test {} not found", payload.test_id))?;

        let trigger = TriggerMetadata {
            source: payload.triggered_by,
            retry_count: job.retry_count(),
        };
        let records = self.executor.execute(&test, &payload.regions, trigger).await;

        // The batch already ran; a stats write failure must not re-run it.
        let stats_saved = match self.aggregator.aggregate(&mut test, &records).await {
            Ok(_) => true,
            Err(e) => {
                warn!(test = %test.id, job_id = %job.id, "Stats not updated: {:#}", e);
                false
            }
        };

        let mut statuses: BTreeMap<&'static str, usize> = BTreeMap::new();
        for record in &records {
            *statuses.entry(record.status.as_str()).or_default() += 1;
        }
        let passed = records.iter().all(|r| r.status == ExecutionStatus::Passed);

        Ok(json!({
            "test_id": test.id,
            "executions": records.iter().map(|r| r.execution_id).collect::<Vec<_>>(),
            "statuses": statuses,
            "passed": passed,
            "stats_saved": stats_saved,
            "success_rate": test.stats.success_rate(),
        }))
    }
}

/// Probes a URL; an unreachable or erroring target fails the job.
pub struct HealthCheckHandler {
    transport: Arc<dyn Transport>,
    user_agent: String,
}

impl HealthCheckHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[async_trait::async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::HealthCheck(payload) = &job.payload else {
            bail!("health-check handler received a {} job", job.kind);
        };

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), self.user_agent.clone());
        let request = OutboundRequest {
            method: HttpMethod::Get,
            url: payload.url.clone(),
            headers,
            query: Vec::new(),
            body: None,
            timeout: Duration::from_millis(payload.timeout_ms),
            follow_redirects: true,
        };

        let started = Instant::now();
        let response = self
            .transport
            .send(&request)
            .await
            .with_context(|| format!("Health check of {} failed", payload.url))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if response.status_code >= 400 {
            bail!(
                "Health check of {} returned status {}",
                payload.url,
                response.status_code
            );
        }

        info!(url = %payload.url, status = response.status_code, elapsed_ms, "Health check passed");
        Ok(json!({
            "url": payload.url,
            "status": response.status_code,
            "response_time_ms": elapsed_ms,
        }))
    }
}

/// Delivers notification jobs to the real-time notifier.
pub struct NotificationHandler {
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
}

impl NotificationHandler {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait::async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::SendNotification(payload) = &job.payload else {
            bail!("send-notification handler received a {} job", job.kind);
        };

        match payload {
            NotificationPayload::Alert(breach) => {
                let project = self
                    .store
                    .get_project(&breach.project_id)
                    .await
                    .with_context(|| format!("Failed to load project {}", breach.project_id))?
                    .ok_or_else(|| anyhow!("project {} not found", breach.project_id))?;

                let severity = breach.severity();
                let event = AlertEvent {
                    kind: breach.metric.to_string(),
                    severity,
                    message: breach.message(),
                    project_id: project.id.clone(),
                    timestamp: breach.detected_at,
                };
                let report = self.notifier.emit_alert(&project.organization, event).await;

                info!(
                    project = %project.id,
                    org = %project.organization,
                    metric = %breach.metric,
                    ?severity,
                    delivered = report.delivered,
                    "Alert pushed"
                );
                Ok(json!({
                    "type": "alert",
                    "organization": project.organization,
                    "delivered": report.delivered,
                    "dropped": report.dropped,
                }))
            }
        }
    }
}

/// Logs the collected snapshot and pushes per-project window metrics.
pub struct MetricsHandler {
    store: Arc<dyn Store>,
    evaluator: AlertEvaluator,
    notifier: Arc<Notifier>,
}

impl MetricsHandler {
    pub fn new(store: Arc<dyn Store>, evaluator: AlertEvaluator, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            evaluator,
            notifier,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for MetricsHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::CalculateMetrics(MetricsPayload {
            collected_at,
            system,
            queues,
        }) = &job.payload
        else {
            bail!("calculate-metrics handler received a {} job", job.kind);
        };

        info!(
            memory_used_mb = system.memory_used_mb,
            memory_total_mb = system.memory_total_mb,
            load_1m = system.load_avg[0],
            engine_uptime_secs = system.engine_uptime_secs,
            "System metrics"
        );
        for (queue, stats) in queues {
            info!(
                queue = %queue,
                waiting = stats.waiting,
                active = stats.active,
                failed = stats.failed,
                "Queue metrics"
            );
        }

        let projects = self
            .store
            .active_projects()
            .await
            .context("Failed to list active projects")?;

        let mut pushed = 0usize;
        for project in &projects {
            let metrics = match self.evaluator.project_metrics(&project.id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(project = %project.id, "Window metrics unavailable: {:#}", e);
                    continue;
                }
            };
            self.notifier
                .emit_metrics(
                    &project.id,
                    json!({
                        "collected_at": collected_at,
                        "window_secs": self.evaluator.lookback().as_secs(),
                        "executions": metrics.executions,
                        "failed": metrics.failed,
                        "failure_rate": metrics.failure_rate,
                        "mean_response_ms": metrics.mean_response_ms,
                    }),
                )
                .await;
            pushed += 1;
        }

        Ok(json!({ "projects": pushed }))
    }
}

/// Build one handler per job kind from shared collaborators.
pub fn standard_handlers(
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    executor: TestExecutor,
    notifier: Arc<Notifier>,
    lookback: Duration,
    user_agent: &str,
) -> Handlers {
    Handlers {
        run_test: Arc::new(RunTestHandler::new(store.clone(), executor)),
        health_check: Arc::new(HealthCheckHandler::new(transport).with_user_agent(user_agent)),
        send_notification: Arc::new(NotificationHandler::new(store.clone(), notifier.clone())),
        calculate_metrics: Arc::new(MetricsHandler::new(
            store.clone(),
            AlertEvaluator::new(store, lookback),
            notifier,
        )),
    }
}
