//! Test definitions: request template, assertions, schedule, regions, stats.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::execution::ExecutionStatus;
use super::value::AssertionValue;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A configured API test owned by a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub request: RequestTemplate,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stats: Stats,
}

impl Test {
    /// An active, unscheduled test with no assertions.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        request: RequestTemplate,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            request,
            assertions: Vec::new(),
            schedule: None,
            regions: Vec::new(),
            active: true,
            stats: Stats::default(),
        }
    }

    /// The recurring interval, if this test should be picked up by the due scan.
    pub fn recurring_interval(&self) -> Option<Duration> {
        match &self.schedule {
            Some(schedule) if self.active && schedule.enabled => Some(schedule.interval.as_duration()),
            _ => None,
        }
    }

    /// Configured regions, or the default region when none are configured.
    pub fn target_regions(&self) -> Vec<Region> {
        if self.regions.is_empty() {
            vec![Region::default()]
        } else {
            self.regions.clone()
        }
    }
}

/// Outbound request template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            auth: AuthConfig::None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            follow_redirects: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    /// Verbs that carry a configured body.
    pub fn carries_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Outbound authentication variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(rename = "apikey")]
    ApiKey {
        key: String,
        value: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// A declarative pass/fail rule evaluated against a captured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default, rename = "value")]
    pub expected: AssertionValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Assertion {
    pub fn new(kind: AssertionKind, operator: Operator, expected: impl Into<AssertionValue>) -> Self {
        Self {
            kind,
            field: None,
            operator,
            expected: expected.into(),
            description: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Status,
    ResponseTime,
    BodyContains,
    HeaderExists,
    JsonPath,
    SchemaValidation,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssertionKind::Status => "status",
            AssertionKind::ResponseTime => "response_time",
            AssertionKind::BodyContains => "body_contains",
            AssertionKind::HeaderExists => "header_exists",
            AssertionKind::JsonPath => "json_path",
            AssertionKind::SchemaValidation => "schema_validation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

/// Recurring schedule attached to a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub interval: ScheduleInterval,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval: ScheduleInterval::new(interval),
            timezone: default_timezone(),
        }
    }
}

/// How often a recurring test wants to run.
///
/// Written as `<n><unit>` with unit `s`, `m`, `h` or `d` (`"15m"`, `"4h"`).
/// Anything unparsable, and zero, falls back to 15 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleInterval(Duration);

impl ScheduleInterval {
    pub const DEFAULT: ScheduleInterval = ScheduleInterval(Duration::from_secs(15 * 60));

    pub fn new(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::DEFAULT
        } else {
            Self(duration)
        }
    }

    /// Parse a label, falling back to the default when it is not understood.
    pub fn parse_or_default(label: &str) -> Self {
        label.parse().unwrap_or(Self::DEFAULT)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ScheduleInterval {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for ScheduleInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("interval '{}' has no unit", s))?;
        let (digits, unit) = s.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("interval '{}' has no count", s))?;
        let secs = match unit {
            "s" => n,
            "m" => n.saturating_mul(60),
            "h" => n.saturating_mul(3600),
            "d" => n.saturating_mul(86_400),
            other => return Err(format!("unknown interval unit '{}'", other)),
        };
        if secs == 0 {
            return Err("interval must be positive".to_string());
        }
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl Serialize for ScheduleInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScheduleInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse_or_default(&label))
    }
}

/// A named locality a test is executed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[default]
    #[serde(rename = "us-east-1")]
    UsEast1,
    #[serde(rename = "us-west-2")]
    UsWest2,
    #[serde(rename = "eu-west-1")]
    EuWest1,
    #[serde(rename = "ap-south-1")]
    ApSouth1,
    #[serde(rename = "ap-southeast-1")]
    ApSoutheast1,
}

impl Region {
    pub const ALL: [Region; 5] = [
        Region::UsEast1,
        Region::UsWest2,
        Region::EuWest1,
        Region::ApSouth1,
        Region::ApSoutheast1,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Region::UsEast1 => "us-east-1",
            Region::UsWest2 => "us-west-2",
            Region::EuWest1 => "eu-west-1",
            Region::ApSouth1 => "ap-south-1",
            Region::ApSoutheast1 => "ap-southeast-1",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|r| r.code() == s)
            .ok_or_else(|| format!("unknown region '{}'", s))
    }
}

/// Rolling health of a test, kept as raw counters.
///
/// Derived figures (success rate, mean latency) are computed on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_runs: u64,
    pub passed_runs: u64,
    /// Records that contributed a duration (everything but `error`).
    pub timed_runs: u64,
    pub total_response_ms: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
}

impl Stats {
    /// Fraction of all runs that passed, 0.0 when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.passed_runs as f64 / self.total_runs as f64
        }
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        if self.timed_runs == 0 {
            0.0
        } else {
            self.total_response_ms as f64 / self.timed_runs as f64
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_timezone() -> String {
    "UTC".to_string()
}
