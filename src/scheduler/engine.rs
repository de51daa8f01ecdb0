use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::SchedulerTaskError;

/// Body of a periodic task, run once per tick.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + Sync {
    async fn tick(&self) -> Result<()>;
}

/// Adapts an async closure into a [`PeriodicTask`].
pub struct FnTask<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> PeriodicTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn tick(&self) -> Result<()> {
        (self.0)().await
    }
}

/// Public view of a registered task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub period_secs: u64,
    pub ticks: u64,
    pub failures: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Registered {
    period: Duration,
    token: CancellationToken,
    status: Arc<Mutex<TaskInfo>>,
}

/// Runs named tasks on fixed periods, independently of each other.
///
/// The first tick of a task fires one period after registration. A tick that
/// errors or panics is logged and the next tick runs on schedule.
#[derive(Clone, Default)]
pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<String, Registered>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `task` under `name`. A task already registered under that name
    /// is cancelled first.
    pub async fn register(&self, name: &str, period: Duration, task: Arc<dyn PeriodicTask>) {
        let period = period.max(Duration::from_millis(1));
        let token = self.shutdown.child_token();
        let status = Arc::new(Mutex::new(TaskInfo {
            name: name.to_string(),
            period_secs: period.as_secs(),
            ..TaskInfo::default()
        }));

        let previous = self.tasks.write().await.insert(
            name.to_string(),
            Registered {
                period,
                token: token.clone(),
                status: Arc::clone(&status),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(task = name, "Replaced periodic task");
        }

        tokio::spawn(run_task(name.to_string(), period, task, token, status));
        info!(task = name, period_secs = period.as_secs(), "Periodic task registered");
    }

    /// Convenience for closure-bodied tasks.
    pub async fn register_fn<F, Fut>(&self, name: &str, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, period, Arc::new(FnTask(f))).await;
    }

    /// Returns `false` when no task had that name.
    pub async fn remove(&self, name: &str) -> bool {
        match self.tasks.write().await.remove(name) {
            Some(task) => {
                task.token.cancel();
                info!(task = name, "Periodic task removed");
                true
            }
            None => false,
        }
    }

    pub async fn tasks(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<TaskInfo> = tasks
            .values()
            .map(|t| match t.status.lock() {
                Ok(status) => status.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn period(&self, name: &str) -> Option<Duration> {
        self.tasks.read().await.get(name).map(|t| t.period)
    }

    /// Stop every task. Ticks in flight run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_task(
    name: String,
    period: Duration,
    task: Arc<dyn PeriodicTask>,
    token: CancellationToken,
    status: Arc<Mutex<TaskInfo>>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let body = Arc::clone(&task);
        let outcome = tokio::spawn(async move { body.tick().await }).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) if e.is_panic() => Some("tick panicked".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let failure = failure.map(|reason| SchedulerTaskError {
            task: name.clone(),
            reason,
        });
        if let Some(err) = &failure {
            error!(task = %name, "{}", err);
        }

        let mut info = match status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info.ticks += 1;
        info.last_tick = Some(Utc::now());
        if let Some(err) = failure {
            info.failures += 1;
            info.last_error = Some(err.reason);
        }
    }

    debug!(task = %name, "Periodic task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_period() {
        let scheduler = Scheduler::new();
        let hits = counter();
        let h = hits.clone();
        scheduler
            .register_fn("count", Duration::from_secs(10), move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_ticks_do_not_stop_the_task() {
        let scheduler = Scheduler::new();
        let hits = counter();
        let h = hits.clone();
        scheduler
            .register_fn("flaky", Duration::from_secs(1), move || {
                let n = h.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => anyhow::bail!("store unavailable"),
                        1 => panic!("boom"),
                        _ => Ok(()),
                    }
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let info = &scheduler.tasks().await[0];
        assert_eq!(info.ticks, 3);
        assert_eq!(info.failures, 2);
        assert_eq!(info.last_error.as_deref(), Some("tick panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistering_cancels_previous() {
        let scheduler = Scheduler::new();
        let old = counter();
        let new = counter();

        let o = old.clone();
        scheduler
            .register_fn("job", Duration::from_secs(1), move || {
                let o = o.clone();
                async move {
                    o.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let n = new.clone();
        scheduler
            .register_fn("job", Duration::from_secs(1), move || {
                let n = n.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(2200)).await;

        assert_eq!(old.load(Ordering::SeqCst), 1);
        assert_eq!(new.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.tasks().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_shutdown() {
        let scheduler = Scheduler::new();
        let hits = counter();
        for name in ["a", "b"] {
            let h = hits.clone();
            scheduler
                .register_fn(name, Duration::from_secs(1), move || {
                    let h = h.clone();
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        }
        assert!(scheduler.remove("a").await);
        assert!(!scheduler.remove("a").await);
        assert_eq!(scheduler.period("b").await, Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
