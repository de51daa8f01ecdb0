use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{ExecutionRecord, ExecutionStatus, Stats, Test};
use crate::storage::Store;

/// Folds completed execution batches into a test's rolling stats.
///
/// Stats are raw counters; success rate and mean latency are derived on read,
/// so folding batch after batch gives the exact historical figures.
pub struct ResultAggregator {
    store: Arc<dyn Store>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Fold `batch` into `test.stats` and persist the result.
    pub async fn aggregate(&self, test: &mut Test, batch: &[ExecutionRecord]) -> Result<Stats> {
        let stats = fold(&test.stats, batch, Utc::now());
        if stats == test.stats {
            return Ok(stats);
        }
        test.stats = stats.clone();

        let found = self
            .store
            .update_stats(&test.id, &stats)
            .await
            .with_context(|| format!("Failed to persist stats for test {}", test.id))?;
        if !found {
            warn!(test = %test.id, "Test disappeared before its stats were saved");
        }
        debug!(
            test = %test.id,
            total_runs = stats.total_runs,
            success_rate = stats.success_rate(),
            avg_ms = stats.avg_response_time_ms(),
            "Stats updated"
        );
        Ok(stats)
    }
}

/// Pure fold of one batch. Non-terminal records are ignored; a batch with
/// no terminal record leaves the stats unchanged.
pub fn fold(previous: &Stats, batch: &[ExecutionRecord], completed_at: DateTime<Utc>) -> Stats {
    let terminal: Vec<&ExecutionRecord> = batch.iter().filter(|r| r.is_terminal()).collect();
    if terminal.is_empty() {
        return previous.clone();
    }

    let passed = terminal
        .iter()
        .filter(|r| r.status == ExecutionStatus::Passed)
        .count() as u64;
    let timed: Vec<u64> = terminal
        .iter()
        .filter(|r| r.status != ExecutionStatus::Error)
        .filter_map(|r| r.duration_ms)
        .collect();

    let mut stats = previous.clone();
    stats.total_runs += terminal.len() as u64;
    stats.passed_runs += passed;
    stats.timed_runs += timed.len() as u64;
    stats.total_response_ms = stats
        .total_response_ms
        .saturating_add(timed.iter().sum::<u64>());
    stats.last_run = Some(completed_at);
    stats.last_status = Some(if passed == terminal.len() as u64 {
        ExecutionStatus::Passed
    } else {
        ExecutionStatus::Failed
    });
    stats
}
