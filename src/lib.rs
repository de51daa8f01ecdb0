//! TestFlow -- scheduled and on-demand API test execution.
//!
//! This crate provides the execution engine: multi-region test runs with
//! declarative assertions, named job queues with retry and backoff, periodic
//! scheduling and alerting, and real-time result streaming to subscribers.

pub mod analysis;
pub mod api;
pub mod assertions;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod model;
pub mod notifier;
pub mod probes;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod system;

pub use self::config::EngineConfig;
pub use self::engine::{serve, Engine};
