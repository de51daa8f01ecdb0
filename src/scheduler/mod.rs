//! Periodic tasks.
//!
//! The scheduler runs named tasks on fixed cadences, each on its own timer,
//! concurrently with each other and with queue workers. The built-in tasks
//! scan for due tests, collect metrics, evaluate alert thresholds and apply
//! retention.

pub mod engine;
pub mod tasks;

pub use self::engine::{FnTask, PeriodicTask, Scheduler, TaskInfo};
pub use self::tasks::{install_builtin, is_due};
