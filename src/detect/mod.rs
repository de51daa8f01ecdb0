//! Alert threshold evaluation over recent execution records.

pub mod engine;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::engine::{AlertEvaluator, WindowMetrics};

/// Severity levels for raised alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Which project threshold was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ErrorRate,
    ResponseTime,
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertMetric::ErrorRate => f.write_str("error_rate"),
            AlertMetric::ResponseTime => f.write_str("response_time"),
        }
    }
}

/// A breached threshold, as carried by an alert notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertBreach {
    pub project_id: String,
    pub metric: AlertMetric,
    pub observed: f64,
    pub threshold: f64,
    pub window_secs: u64,
    /// Terminal records the observation is based on.
    pub sample_size: usize,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl AlertBreach {
    /// Critical once the observation reaches twice the threshold.
    pub fn severity(&self) -> Severity {
        if self.threshold > 0.0 && self.observed >= self.threshold * 2.0 {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }

    pub fn message(&self) -> String {
        let minutes = self.window_secs / 60;
        match self.metric {
            AlertMetric::ErrorRate => format!(
                "Error rate {:.1}% exceeds threshold {:.1}% over the last {} min",
                self.observed * 100.0,
                self.threshold * 100.0,
                minutes
            ),
            AlertMetric::ResponseTime => format!(
                "Mean response time {:.0} ms exceeds threshold {:.0} ms over the last {} min",
                self.observed, self.threshold, minutes
            ),
        }
    }
}
