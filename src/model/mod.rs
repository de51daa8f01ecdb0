//! Domain model shared by the executor, queues, scheduler and notifier.

pub mod definition;
pub mod execution;
pub mod project;
pub mod value;

pub use self::definition::{
    ApiKeyLocation, Assertion, AssertionKind, AuthConfig, HttpMethod, Operator, Region,
    RequestTemplate, Schedule, ScheduleInterval, Stats, Test,
};
pub use self::execution::{
    AssertionResult, CapturedResponse, Completion, ExecutionRecord, ExecutionStatus,
    FailureDetail, TriggerMetadata, TriggerSource,
};
pub use self::project::{AlertThresholds, Project};
pub use self::value::AssertionValue;
