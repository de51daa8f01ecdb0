use serde::{Deserialize, Serialize};

/// A project groups tests and owns the alert thresholds evaluated for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub organization: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

impl Project {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            organization: organization.into(),
            active: true,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Mean response latency above which an alert fires (milliseconds).
    pub response_time_ms: f64,
    /// Failure fraction (0.0 - 1.0) above which an alert fires.
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 5000.0,
            error_rate: 0.05,
        }
    }
}

fn default_active() -> bool {
    true
}
