//! Frames exchanged with subscribers: `{"event": ..., "data": ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::Severity;
use crate::model::{ExecutionRecord, ExecutionStatus, Region};

/// `timestamp` is when the execution started, so the creation and
/// finalization events of one record carry the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultEvent {
    pub test_id: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub duration_ms: Option<u64>,
    pub region: Region,
    pub timestamp: DateTime<Utc>,
}

impl From<&ExecutionRecord> for TestResultEvent {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            test_id: record.test_id.clone(),
            execution_id: record.execution_id,
            status: record.status,
            duration_ms: record.duration_ms,
            region: record.region,
            timestamp: record.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdateEvent {
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: serde_json::Value,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    TestResult(TestResultEvent),
    Alert(AlertEvent),
    MetricsUpdate(MetricsUpdateEvent),
    /// Acknowledges a channel join, including the automatic organization join.
    Joined { channel: String },
    Left { channel: String },
    Error { message: String },
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinProject(String),
    LeaveProject(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shapes() {
        let frame = serde_json::to_value(ServerEvent::Joined {
            channel: "org:o1".into(),
        })
        .unwrap();
        assert_eq!(
            frame,
            serde_json::json!({"event": "joined", "data": {"channel": "org:o1"}})
        );

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event":"join_project","data":"p-7"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::JoinProject("p-7".into()));
    }

    #[test]
    fn test_result_timestamp_is_start_time() {
        use crate::model::{Completion, RequestTemplate, Test, TriggerMetadata};

        let test = Test::new("t1", "p1", "t", RequestTemplate::get("http://localhost/"));
        let mut record = ExecutionRecord::start(&test, Region::EuWest1, TriggerMetadata::default());
        let created = TestResultEvent::from(&record);
        record
            .finalize(Completion {
                status: ExecutionStatus::Passed,
                duration: std::time::Duration::from_millis(12),
                response: None,
                assertions: Vec::new(),
                error: None,
            })
            .unwrap();
        let finished = TestResultEvent::from(&record);

        assert_eq!(created.timestamp, record.started_at);
        assert_eq!(finished.timestamp, record.started_at);
        assert_eq!(finished.status, ExecutionStatus::Passed);
        assert_eq!(finished.duration_ms, Some(12));
    }

    #[test]
    fn test_alert_type_field() {
        let event = AlertEvent {
            kind: "error_rate".into(),
            severity: Severity::Critical,
            message: "high".into(),
            project_id: "p1".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(ServerEvent::Alert(event)).unwrap();
        assert_eq!(json["event"], "alert");
        assert_eq!(json["data"]["type"], "error_rate");
        assert_eq!(json["data"]["severity"], "critical");
    }
}
