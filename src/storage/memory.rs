//! In-process store.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::model::{ExecutionRecord, Project, Stats, Test};

#[derive(Default)]
pub struct MemoryStore {
    tests: RwLock<HashMap<String, Test>>,
    projects: RwLock<HashMap<String, Project>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record of a test, oldest first.
    pub async fn executions_for_test(&self, test_id: &str) -> Vec<ExecutionRecord> {
        let executions = self.executions.read().await;
        let mut records: Vec<ExecutionRecord> = executions
            .values()
            .filter(|r| r.test_id == test_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_test(&self, id: &str) -> Result<Option<Test>> {
        Ok(self.tests.read().await.get(id).cloned())
    }

    async fn save_test(&self, test: &Test) -> Result<()> {
        self.tests.write().await.insert(test.id.clone(), test.clone());
        Ok(())
    }

    async fn scheduled_tests(&self) -> Result<Vec<Test>> {
        let tests = self.tests.read().await;
        Ok(tests
            .values()
            .filter(|t| t.recurring_interval().is_some())
            .cloned()
            .collect())
    }

    async fn update_stats(&self, test_id: &str, stats: &Stats) -> Result<bool> {
        let mut tests = self.tests.write().await;
        match tests.get_mut(test_id) {
            Some(test) => {
                test.stats = stats.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn active_projects(&self) -> Result<Vec<Project>> {
        let projects = self.projects.read().await;
        Ok(projects.values().filter(|p| p.active).cloned().collect())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn executions_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut records: Vec<ExecutionRecord> = executions
            .values()
            .filter(|r| r.project_id == project_id && r.started_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, r| r.started_at >= cutoff);
        Ok(before - executions.len())
    }
}
