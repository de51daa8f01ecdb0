use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detect::{AlertBreach, AlertMetric};
use crate::model::{ExecutionRecord, ExecutionStatus, Project};
use crate::storage::Store;

/// Figures of one project over the lookback window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub executions: usize,
    pub failed: usize,
    /// failed / executions, 0.0 for an empty window.
    pub failure_rate: f64,
    /// Mean latency of records that captured a response.
    pub mean_response_ms: Option<f64>,
}

impl WindowMetrics {
    /// Only terminal records count; `running` ones are still in flight.
    /// `failed`, `error` and `timeout` are all failures, and latency is
    /// averaged over records that captured a response.
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let terminal: Vec<&ExecutionRecord> = records.iter().filter(|r| r.is_terminal()).collect();
        let failed = terminal
            .iter()
            .filter(|r| r.status != ExecutionStatus::Passed)
            .count();

        let latencies: Vec<u64> = terminal
            .iter()
            .filter_map(|r| r.response.as_ref().map(|resp| resp.response_time_ms))
            .collect();
        let mean_response_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };

        let failure_rate = if terminal.is_empty() {
            0.0
        } else {
            failed as f64 / terminal.len() as f64
        };

        Self {
            executions: terminal.len(),
            failed,
            failure_rate,
            mean_response_ms,
        }
    }

    /// Thresholds breached by these metrics. A value equal to its threshold
    /// is not a breach.
    pub fn breaches(&self, project: &Project, window: Duration) -> Vec<AlertBreach> {
        if self.executions == 0 {
            return Vec::new();
        }
        let thresholds = project.alert_thresholds;
        let now = Utc::now();
        let mut out = Vec::new();

        if self.failure_rate > thresholds.error_rate {
            out.push(AlertBreach {
                project_id: project.id.clone(),
                metric: AlertMetric::ErrorRate,
                observed: self.failure_rate,
                threshold: thresholds.error_rate,
                window_secs: window.as_secs(),
                sample_size: self.executions,
                detected_at: now,
            });
        }

        if let Some(mean) = self.mean_response_ms {
            if mean > thresholds.response_time_ms {
                out.push(AlertBreach {
                    project_id: project.id.clone(),
                    metric: AlertMetric::ResponseTime,
                    observed: mean,
                    threshold: thresholds.response_time_ms,
                    window_secs: window.as_secs(),
                    sample_size: self.executions,
                    detected_at: now,
                });
            }
        }

        out
    }
}

/// Reads each active project's recent records and reports breached thresholds.
pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    lookback: Duration,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn Store>, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Metrics of one project over the lookback window.
    pub async fn project_metrics(&self, project_id: &str) -> Result<WindowMetrics> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.lookback).context("Lookback window out of range")?;
        let records = self
            .store
            .executions_since(project_id, since)
            .await
            .with_context(|| format!("Failed to load executions for project {}", project_id))?;
        Ok(WindowMetrics::from_records(&records))
    }

    /// Run one scan over all active projects. A project whose records cannot
    /// be read is skipped.
    pub async fn scan(&self) -> Result<Vec<AlertBreach>> {
        let projects = self
            .store
            .active_projects()
            .await
            .context("Failed to list active projects")?;

        let mut breaches = Vec::new();
        for project in projects {
            match self.project_metrics(&project.id).await {
                Ok(metrics) => {
                    debug!(
                        project = %project.id,
                        executions = metrics.executions,
                        failure_rate = metrics.failure_rate,
                        "Window metrics"
                    );
                    breaches.extend(metrics.breaches(&project, self.lookback));
                }
                Err(e) => warn!(project = %project.id, "Alert evaluation skipped: {:#}", e),
            }
        }
        Ok(breaches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CapturedResponse, Completion, Region, RequestTemplate, Test, TriggerMetadata,
        TriggerSource,
    };
    use crate::storage::MemoryStore;

    fn record(status: ExecutionStatus, latency: Option<u64>) -> ExecutionRecord {
        let test = Test::new("t1", "p1", "t", RequestTemplate::get("http://localhost/"));
        let mut r = ExecutionRecord::start(
            &test,
            Region::UsEast1,
            TriggerMetadata::new(TriggerSource::Scheduled),
        );
        r.finalize(Completion {
            status,
            duration: Duration::from_millis(latency.unwrap_or(0)),
            response: latency.map(|ms| CapturedResponse {
                status_code: 200,
                headers: Default::default(),
                body: serde_json::Value::Null,
                size: 0,
                response_time_ms: ms,
            }),
            assertions: Vec::new(),
            error: None,
        })
        .unwrap();
        r
    }

    #[test]
    fn test_failure_rate_counts_error_and_timeout() {
        let records = vec![
            record(ExecutionStatus::Passed, Some(100)),
            record(ExecutionStatus::Failed, Some(300)),
            record(ExecutionStatus::Error, None),
            record(ExecutionStatus::Timeout, None),
        ];
        let m = WindowMetrics::from_records(&records);
        assert_eq!(m.executions, 4);
        assert_eq!(m.failed, 3);
        assert!((m.failure_rate - 0.75).abs() < 1e-9);
        assert_eq!(m.mean_response_ms, Some(200.0));
    }

    #[test]
    fn test_running_records_left_out_of_window() {
        let test = Test::new("t1", "p1", "t", RequestTemplate::get("http://localhost/"));
        let running = ExecutionRecord::start(
            &test,
            Region::UsEast1,
            TriggerMetadata::new(TriggerSource::Manual),
        );
        let records = vec![
            running,
            record(ExecutionStatus::Passed, Some(100)),
            record(ExecutionStatus::Error, None),
        ];
        let m = WindowMetrics::from_records(&records);
        assert_eq!(m.executions, 2);
        assert_eq!(m.failed, 1);
        assert!((m.failure_rate - 0.5).abs() < 1e-9);
        // The error record carried no response, so it adds no latency sample.
        assert_eq!(m.mean_response_ms, Some(100.0));

        let project = Project::new("p1", "p", "org-1");
        let breaches = m.breaches(&project, Duration::from_secs(900));
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, AlertMetric::ErrorRate);
    }

    #[test]
    fn test_equal_to_threshold_is_not_breach() {
        let project = Project::new("p1", "p", "org-1");
        let metrics = WindowMetrics {
            executions: 20,
            failed: 1,
            failure_rate: 0.05,
            mean_response_ms: Some(5000.0),
        };
        assert!(metrics.breaches(&project, Duration::from_secs(900)).is_empty());
    }

    #[test]
    fn test_both_thresholds_breached() {
        let project = Project::new("p1", "p", "org-1");
        let metrics = WindowMetrics {
            executions: 10,
            failed: 5,
            failure_rate: 0.5,
            mean_response_ms: Some(7000.0),
        };
        let breaches = metrics.breaches(&project, Duration::from_secs(900));
        assert_eq!(breaches.len(), 2);
        assert_eq!(breaches[0].metric, AlertMetric::ErrorRate);
        assert_eq!(breaches[1].metric, AlertMetric::ResponseTime);
    }

    #[tokio::test]
    async fn test_scan_reads_store_window() {
        let store = Arc::new(MemoryStore::new());
        store.save_project(&Project::new("p1", "p", "org-1")).await.unwrap();
        for _ in 0..3 {
            store
                .save_execution(&record(ExecutionStatus::Error, None))
                .await
                .unwrap();
        }
        let evaluator = AlertEvaluator::new(store, Duration::from_secs(900));
        let breaches = evaluator.scan().await.unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, AlertMetric::ErrorRate);
        assert_eq!(breaches[0].observed, 1.0);
    }
}
