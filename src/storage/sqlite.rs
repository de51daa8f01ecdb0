//! SQLite-backed store. Entities are kept as JSON documents next to the
//! handful of columns the queries filter on.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{open_pool, Pool, Store};
use crate::model::{ExecutionRecord, Project, Stats, Test};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `path`, running migrations.
    pub fn open(path: &str) -> Result<Self> {
        let pool = open_pool(path).with_context(|| format!("Failed to open database {}", path))?;
        Ok(Self::new(pool))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

/// Fixed-width UTC timestamps so text comparison orders chronologically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode<T: DeserializeOwned>(doc: String) -> Result<T> {
    serde_json::from_str(&doc).context("Corrupt stored document")
}

fn write_test(conn: &Connection, test: &Test) -> Result<()> {
    let doc = serde_json::to_string(test)?;
    conn.execute(
        "INSERT INTO tests (id, project_id, active, scheduled, doc_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            active = excluded.active,
            scheduled = excluded.scheduled,
            doc_json = excluded.doc_json,
            updated_at = datetime('now')",
        params![
            test.id,
            test.project_id,
            test.active,
            test.schedule.as_ref().map(|s| s.enabled).unwrap_or(false),
            doc
        ],
    )?;
    Ok(())
}

fn read_test(conn: &Connection, id: &str) -> Result<Option<Test>> {
    let doc: Option<String> = conn
        .query_row("SELECT doc_json FROM tests WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    doc.map(decode).transpose()
}

fn read_docs<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for doc in rows {
        out.push(decode(doc?)?);
    }
    Ok(out)
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get_test(&self, id: &str) -> Result<Option<Test>> {
        let id = id.to_string();
        self.with_conn(move |conn| read_test(conn, &id)).await
    }

    async fn save_test(&self, test: &Test) -> Result<()> {
        let test = test.clone();
        self.with_conn(move |conn| write_test(conn, &test)).await
    }

    async fn scheduled_tests(&self) -> Result<Vec<Test>> {
        self.with_conn(|conn| {
            read_docs(
                conn,
                "SELECT doc_json FROM tests WHERE active = 1 AND scheduled = 1 ORDER BY id",
                [],
            )
        })
        .await
    }

    async fn update_stats(&self, test_id: &str, stats: &Stats) -> Result<bool> {
        let test_id = test_id.to_string();
        let stats = stats.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(mut test) = read_test(&tx, &test_id)? else {
                return Ok(false);
            };
            test.stats = stats;
            write_test(&tx, &test)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc_json FROM projects WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            doc.map(decode).transpose()
        })
        .await
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        let project = project.clone();
        self.with_conn(move |conn| {
            let doc = serde_json::to_string(&project)?;
            conn.execute(
                "INSERT INTO projects (id, organization, active, doc_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    organization = excluded.organization,
                    active = excluded.active,
                    doc_json = excluded.doc_json,
                    updated_at = datetime('now')",
                params![project.id, project.organization, project.active, doc],
            )?;
            Ok(())
        })
        .await
    }

    async fn active_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            read_docs(
                conn,
                "SELECT doc_json FROM projects WHERE active = 1 ORDER BY id",
                [],
            )
        })
        .await
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let doc = serde_json::to_string(&record)?;
            conn.execute(
                "INSERT INTO executions
                    (execution_id, test_id, project_id, region, status, started_at, doc_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    status = excluded.status,
                    doc_json = excluded.doc_json",
                params![
                    record.execution_id.to_string(),
                    record.test_id,
                    record.project_id,
                    record.region.code(),
                    record.status.as_str(),
                    timestamp(record.started_at),
                    doc
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        self.with_conn(move |conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc_json FROM executions WHERE execution_id = ?1",
                    params![execution_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            doc.map(decode).transpose()
        })
        .await
    }

    async fn executions_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            read_docs(
                conn,
                "SELECT doc_json FROM executions
                 WHERE project_id = ?1 AND started_at >= ?2
                 ORDER BY started_at",
                params![project_id, timestamp(since)],
            )
        })
        .await
    }

    async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM executions WHERE started_at < ?1",
                params![timestamp(cutoff)],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Completion, ExecutionStatus, Region, RequestTemplate, Schedule, TriggerMetadata,
        TriggerSource,
    };
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testflow.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn sample_test(id: &str) -> Test {
        let mut test = Test::new(id, "proj-1", "health", RequestTemplate::get("http://localhost/"));
        test.schedule = Some(Schedule::every(Duration::from_secs(300)));
        test
    }

    #[tokio::test]
    async fn test_save_and_load_test() {
        let (_dir, store) = store();
        store.save_test(&sample_test("t-1")).await.unwrap();

        let loaded = store.get_test("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.project_id, "proj-1");
        assert!(store.get_test("missing").await.unwrap().is_none());

        let scheduled = store.scheduled_tests().await.unwrap();
        assert_eq!(scheduled.len(), 1);

        let mut unscheduled = sample_test("t-2");
        unscheduled.schedule = None;
        store.save_test(&unscheduled).await.unwrap();
        assert_eq!(store.scheduled_tests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_stats_keeps_configuration() {
        let (_dir, store) = store();
        store.save_test(&sample_test("t-1")).await.unwrap();

        let stats = Stats {
            total_runs: 4,
            passed_runs: 3,
            ..Stats::default()
        };
        assert!(store.update_stats("t-1", &stats).await.unwrap());
        assert!(!store.update_stats("missing", &stats).await.unwrap());

        let loaded = store.get_test("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.stats.total_runs, 4);
        assert_eq!(loaded.request.url, "http://localhost/");
    }

    #[tokio::test]
    async fn test_execution_upsert_window_and_purge() {
        let (_dir, store) = store();
        let test = sample_test("t-1");

        let mut record = ExecutionRecord::start(
            &test,
            Region::EuWest1,
            TriggerMetadata::new(TriggerSource::Scheduled),
        );
        store.save_execution(&record).await.unwrap();
        record
            .finalize(Completion {
                status: ExecutionStatus::Passed,
                duration: Duration::from_millis(12),
                response: None,
                assertions: Vec::new(),
                error: None,
            })
            .unwrap();
        store.save_execution(&record).await.unwrap();

        let loaded = store.get_execution(record.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Passed);

        let window = store
            .executions_since("proj-1", Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);

        let later = store
            .executions_since("proj-1", Utc::now() + ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert!(later.is_empty());

        let removed = store
            .purge_executions_before(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_execution(record.execution_id).await.unwrap().is_none());
    }
}
