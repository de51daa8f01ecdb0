//! Execution records: the outcome of running one test in one region.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::{AssertionKind, Region, Test};
use super::value::AssertionValue;
use crate::error::RecordError;

/// Lifecycle of an execution record. `Running` moves to exactly one terminal
/// state and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Passed,
    Failed,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Scheduled,
    Webhook,
    Api,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Api => "api",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub source: TriggerSource,
    /// Zero on the first delivery of the job that produced this record.
    pub retry_count: u32,
}

impl TriggerMetadata {
    pub fn new(source: TriggerSource) -> Self {
        Self {
            source,
            retry_count: 0,
        }
    }
}

/// Snapshot of the response a test received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status_code: u16,
    /// Lower-cased header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, a string otherwise, null when unread.
    pub body: serde_json::Value,
    pub size: u64,
    pub response_time_ms: u64,
}

impl CapturedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == wanted)
            .map(|(_, v)| v.as_str())
    }

    /// The body as text: strings verbatim, anything else as JSON.
    pub fn body_text(&self) -> String {
        match &self.body {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub passed: bool,
    pub expected: AssertionValue,
    pub actual: AssertionValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Transport-level failure attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub code: String,
}

/// Terminal data written once when an execution finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub duration: Duration,
    pub response: Option<CapturedResponse>,
    pub assertions: Vec<AssertionResult>,
    pub error: Option<FailureDetail>,
}

/// One (test, region, trigger) occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub test_id: String,
    pub project_id: String,
    pub region: Region,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub response: Option<CapturedResponse>,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
    #[serde(default)]
    pub error: Option<FailureDetail>,
    pub trigger: TriggerMetadata,
}

impl ExecutionRecord {
    /// Open a new record in `running` state.
    pub fn start(test: &Test, region: Region, trigger: TriggerMetadata) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            test_id: test.id.clone(),
            project_id: test.project_id.clone(),
            region,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            response: None,
            assertions: Vec::new(),
            error: None,
            trigger,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the record to its terminal state. Fails if it already has one.
    pub fn finalize(&mut self, completion: Completion) -> Result<(), RecordError> {
        if self.is_terminal() {
            return Err(RecordError::AlreadyFinalized {
                execution_id: self.execution_id,
                status: self.status,
            });
        }
        if !completion.status.is_terminal() {
            return Err(RecordError::NotTerminal {
                execution_id: self.execution_id,
            });
        }
        let duration_ms = u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX);
        self.status = completion.status;
        self.ended_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.response = completion.response;
        self.assertions = completion.assertions;
        self.error = completion.error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::RequestTemplate;

    fn sample_test() -> Test {
        Test {
            id: "t1".into(),
            project_id: "p1".into(),
            name: "sample".into(),
            request: RequestTemplate::get("http://localhost/"),
            assertions: Vec::new(),
            schedule: None,
            regions: Vec::new(),
            active: true,
            stats: Default::default(),
        }
    }

    fn passed_completion() -> Completion {
        Completion {
            status: ExecutionStatus::Passed,
            duration: Duration::from_millis(42),
            response: None,
            assertions: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_finalize_once() {
        let mut record = ExecutionRecord::start(&sample_test(), Region::UsEast1, TriggerMetadata::default());
        assert_eq!(record.status, ExecutionStatus::Running);
        record.finalize(passed_completion()).unwrap();
        assert_eq!(record.status, ExecutionStatus::Passed);
        assert_eq!(record.duration_ms, Some(42));
        assert!(record.ended_at.is_some());

        let err = record.finalize(passed_completion()).unwrap_err();
        assert!(matches!(err, RecordError::AlreadyFinalized { .. }));
        assert_eq!(record.status, ExecutionStatus::Passed);
    }

    #[test]
    fn test_finalize_rejects_running() {
        let mut record = ExecutionRecord::start(&sample_test(), Region::UsEast1, TriggerMetadata::default());
        let mut completion = passed_completion();
        completion.status = ExecutionStatus::Running;
        assert!(matches!(
            record.finalize(completion),
            Err(RecordError::NotTerminal { .. })
        ));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("x-trace-id".to_string(), "abc".to_string());
        let response = CapturedResponse {
            status_code: 200,
            headers,
            body: serde_json::Value::Null,
            size: 0,
            response_time_ms: 1,
        };
        assert_eq!(response.header("X-Trace-Id"), Some("abc"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_record_serde_preserves_results() {
        let mut record = ExecutionRecord::start(&sample_test(), Region::ApSouth1, TriggerMetadata::new(TriggerSource::Scheduled));
        let mut completion = passed_completion();
        completion.status = ExecutionStatus::Failed;
        completion.assertions = vec![
            AssertionResult {
                kind: AssertionKind::Status,
                description: Some("is ok".into()),
                passed: false,
                expected: AssertionValue::Number(200.0),
                actual: AssertionValue::Number(503.0),
                error: None,
            },
            AssertionResult {
                kind: AssertionKind::SchemaValidation,
                description: None,
                passed: false,
                expected: AssertionValue::Null,
                actual: AssertionValue::Null,
                error: Some("unsupported".into()),
            },
        ];
        record.finalize(completion).unwrap();

        let json = serde_json::to_string(&record).unwrap();
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, record.status);
        assert_eq!(back.duration_ms, record.duration_ms);
        assert_eq!(back.assertions, record.assertions);
        assert_eq!(back.trigger.source, TriggerSource::Scheduled);
    }
}
