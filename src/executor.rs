//! Multi-region test execution.
//!
//! Each region gets its own record and its own task. The batch waits for
//! every region, so the caller always receives one terminal record per
//! region no matter how many of them failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::assertions::evaluate_all;
use crate::error::NetworkError;
use crate::model::{
    CapturedResponse, Completion, ExecutionRecord, ExecutionStatus, FailureDetail, Region, Test,
    TriggerMetadata,
};
use crate::notifier::Notifier;
use crate::probes::{build_request, Transport};
use crate::storage::Store;

pub const DEFAULT_USER_AGENT: &str = "TestFlow/1.0";

#[derive(Clone)]
pub struct TestExecutor {
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    notifier: Option<Arc<Notifier>>,
    user_agent: String,
}

impl TestExecutor {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn Store>) -> Self {
        Self {
            transport,
            store,
            notifier: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Run `test` once per region, concurrently. An empty `regions` falls
    /// back to the test's configured regions (or the default region).
    pub async fn execute(
        &self,
        test: &Test,
        regions: &[Region],
        trigger: TriggerMetadata,
    ) -> Vec<ExecutionRecord> {
        let regions = if regions.is_empty() {
            test.target_regions()
        } else {
            regions.to_vec()
        };
        info!(test = %test.id, regions = regions.len(), source = %trigger.source, "Executing test");

        let test = Arc::new(test.clone());
        let mut started = Vec::with_capacity(regions.len());
        for region in regions {
            let record = ExecutionRecord::start(&test, region, trigger);
            self.persist(&record).await;
            self.announce(&record).await;
            started.push(record);
        }

        let tasks = started.iter().cloned().map(|record| {
            let executor = self.clone();
            let test = Arc::clone(&test);
            tokio::spawn(async move { executor.run_region(&test, record).await })
        });
        let joined = join_all(tasks).await;

        let mut records = Vec::with_capacity(joined.len());
        for (result, mut fallback) in joined.into_iter().zip(started) {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    // The region task died before finalizing; close the record here.
                    error!(test = %test.id, region = %fallback.region, "Region task aborted: {}", e);
                    let completion = Completion {
                        status: ExecutionStatus::Error,
                        duration: Duration::ZERO,
                        response: None,
                        assertions: Vec::new(),
                        error: Some(FailureDetail {
                            message: format!("execution aborted: {}", e),
                            code: "ABORTED".to_string(),
                        }),
                    };
                    if fallback.finalize(completion).is_ok() {
                        self.persist(&fallback).await;
                        self.announce(&fallback).await;
                    }
                    records.push(fallback);
                }
            }
        }
        records
    }

    async fn run_region(&self, test: &Test, mut record: ExecutionRecord) -> ExecutionRecord {
        let request = build_request(&test.request, &self.user_agent);
        debug!(test = %test.id, region = %record.region, method = request.method.as_str(), url = %request.url, "Sending request");

        let started = Instant::now();
        let outcome = self.transport.send(&request).await;
        let elapsed = started.elapsed();

        let completion = complete(test, outcome, elapsed);
        if let Err(e) = record.finalize(completion) {
            warn!(execution = %record.execution_id, "Record not finalized: {}", e);
        }
        info!(
            test = %test.id,
            execution = %record.execution_id,
            region = %record.region,
            status = %record.status,
            duration_ms = record.duration_ms.unwrap_or_default(),
            "Execution finished"
        );

        self.persist(&record).await;
        self.announce(&record).await;
        record
    }

    async fn persist(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.save_execution(record).await {
            error!(execution = %record.execution_id, "Failed to save execution record: {:#}", e);
        }
    }

    async fn announce(&self, record: &ExecutionRecord) {
        if let Some(notifier) = &self.notifier {
            notifier.emit_test_result(record).await;
        }
    }
}

/// Classify a network outcome and score the assertions.
///
/// A status of 400 or above is an `error` carrying the response; its
/// assertions are not evaluated.
pub fn complete(
    test: &Test,
    outcome: Result<CapturedResponse, NetworkError>,
    elapsed: Duration,
) -> Completion {
    let outcome = outcome.and_then(|response| {
        if response.status_code >= 400 {
            Err(NetworkError::from_status(response))
        } else {
            Ok(response)
        }
    });
    match outcome {
        Ok(response) => {
            let assertions = evaluate_all(&test.assertions, &response, elapsed);
            let status = if assertions.iter().all(|a| a.passed) {
                ExecutionStatus::Passed
            } else {
                ExecutionStatus::Failed
            };
            Completion {
                status,
                duration: elapsed,
                response: Some(response),
                assertions,
                error: None,
            }
        }
        Err(err) => {
            let status = match err {
                NetworkError::Timeout { .. } => ExecutionStatus::Timeout,
                NetworkError::Transport { .. } => ExecutionStatus::Error,
            };
            let error = FailureDetail {
                message: err.to_string(),
                code: err.code().to_string(),
            };
            let response = match err {
                NetworkError::Transport { partial, .. } => partial.map(|p| *p),
                NetworkError::Timeout { .. } => None,
            };
            Completion {
                status,
                duration: elapsed,
                response,
                assertions: Vec::new(),
                error: Some(error),
            }
        }
    }
}
