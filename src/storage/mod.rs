//! Persistence collaborator for tests, projects and execution records.
//!
//! The engine only talks to the [`Store`] trait. [`MemoryStore`] backs tests
//! and ephemeral runs; [`SqliteStore`] keeps JSON documents in SQLite behind
//! an r2d2 pool.

pub mod memory;
pub mod schema;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use uuid::Uuid;

use crate::model::{ExecutionRecord, Project, Stats, Test};

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Create/read/update access to the entities the engine works on.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_test(&self, id: &str) -> Result<Option<Test>>;

    async fn save_test(&self, test: &Test) -> Result<()>;

    /// Active tests whose schedule is enabled.
    async fn scheduled_tests(&self) -> Result<Vec<Test>>;

    /// Overwrite only the stats of a test, leaving its configuration alone.
    /// Returns `false` when the test does not exist.
    async fn update_stats(&self, test_id: &str, stats: &Stats) -> Result<bool>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    async fn save_project(&self, project: &Project) -> Result<()>;

    async fn active_projects(&self) -> Result<Vec<Project>>;

    /// Insert or replace an execution record.
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Records of a project started at or after `since`.
    async fn executions_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Delete records started before `cutoff`; returns how many were removed.
    async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
