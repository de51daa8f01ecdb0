use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{EnqueueOptions, Job, JobHandle, JobPayload, JobState};
use super::{Handlers, JobHandler, JobKind, QueueConfig, QueueName};
use crate::error::{QueueError, ValidationError};

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

struct Entry {
    job: Job,
    state_tx: watch::Sender<JobState>,
}

impl Entry {
    fn set_state(&mut self, state: JobState) {
        self.job.state = state;
        self.state_tx.send_replace(state);
    }
}

#[derive(Default)]
struct Jobs {
    entries: HashMap<Uuid, Entry>,
    waiting: HashMap<JobKind, VecDeque<Uuid>>,
    /// Terminal jobs in finishing order, for retention.
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    paused: bool,
}

impl Jobs {
    fn push_waiting(&mut self, kind: JobKind, id: Uuid) {
        self.waiting.entry(kind).or_default().push_back(id);
    }

    fn forget(&mut self, id: Uuid) {
        self.entries.remove(&id);
        for lane in self.waiting.values_mut() {
            lane.retain(|queued| *queued != id);
        }
        self.completed.retain(|done| *done != id);
        self.failed.retain(|done| *done != id);
    }
}

fn evict(list: &mut VecDeque<Uuid>, entries: &mut HashMap<Uuid, Entry>, keep: usize) {
    while list.len() > keep {
        if let Some(oldest) = list.pop_front() {
            entries.remove(&oldest);
        }
    }
}

/// Worker slots of one (queue, kind) pair.
struct Lane {
    concurrency: usize,
    token: CancellationToken,
}

/// What to do after a failed attempt, decided under the lock.
enum AfterFailure {
    RetryNow(JobKind),
    RetryAfter(Duration),
    GiveUp,
}

struct Queue {
    name: QueueName,
    config: QueueConfig,
    jobs: Mutex<Jobs>,
    notifies: HashMap<JobKind, Arc<Notify>>,
    lanes: Mutex<HashMap<JobKind, Lane>>,
    shutdown: CancellationToken,
}

impl Queue {
    fn new(name: QueueName, config: QueueConfig, shutdown: CancellationToken) -> Self {
        let notifies = name.kinds().map(|k| (k, Arc::new(Notify::new()))).collect();
        Self {
            name,
            config,
            jobs: Mutex::new(Jobs::default()),
            notifies,
            lanes: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn wake(&self, kind: JobKind) {
        if let Some(notify) = self.notifies.get(&kind) {
            notify.notify_one();
        }
    }

    fn wake_all(&self) {
        for notify in self.notifies.values() {
            notify.notify_waiters();
        }
    }

    /// Take the oldest waiting job of `kind` and mark it active.
    async fn claim(&self, kind: JobKind) -> Option<Job> {
        let mut guard = self.jobs.lock().await;
        let jobs = &mut *guard;
        if jobs.paused {
            return None;
        }
        loop {
            let id = jobs.waiting.get_mut(&kind).and_then(|lane| lane.pop_front())?;
            let Some(entry) = jobs.entries.get_mut(&id) else {
                continue;
            };
            if entry.job.state != JobState::Waiting {
                continue;
            }
            entry.job.attempts_made += 1;
            entry.job.processed_at = Some(Utc::now());
            entry.set_state(JobState::Active);
            return Some(entry.job.clone());
        }
    }

    async fn settle(self: &Arc<Self>, id: Uuid, outcome: Result<serde_json::Value, String>) {
        let mut guard = self.jobs.lock().await;
        let jobs = &mut *guard;
        let Some(entry) = jobs.entries.get_mut(&id) else {
            return;
        };
        let kind = entry.job.kind;

        let reason = match outcome {
            Ok(value) => {
                entry.job.return_value = Some(value);
                entry.job.finished_at = Some(Utc::now());
                entry.set_state(JobState::Completed);
                info!(queue = %self.name, job_id = %id, kind = %kind, attempts = entry.job.attempts_made, "Job completed");
                jobs.completed.push_back(id);
                evict(&mut jobs.completed, &mut jobs.entries, self.config.keep_completed);
                return;
            }
            Err(reason) => reason,
        };

        let attempts = entry.job.attempts_made;
        let max_attempts = entry.job.retry.max_attempts;
        entry.job.failed_reason = Some(reason.clone());

        let next = if attempts < max_attempts {
            let delay = entry.job.retry.backoff.delay_for(attempts);
            warn!(
                queue = %self.name,
                job_id = %id,
                kind = %kind,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Job failed, retrying"
            );
            if delay.is_zero() {
                entry.set_state(JobState::Waiting);
                AfterFailure::RetryNow(kind)
            } else {
                entry.set_state(JobState::Delayed);
                AfterFailure::RetryAfter(delay)
            }
        } else {
            entry.job.finished_at = Some(Utc::now());
            entry.set_state(JobState::Failed);
            error!(
                queue = %self.name,
                job_id = %id,
                kind = %kind,
                attempts,
                error = %reason,
                "Job failed permanently"
            );
            AfterFailure::GiveUp
        };

        match next {
            AfterFailure::RetryNow(kind) => {
                jobs.push_waiting(kind, id);
                drop(guard);
                self.wake(kind);
            }
            AfterFailure::RetryAfter(delay) => {
                drop(guard);
                self.release_after(id, delay);
            }
            AfterFailure::GiveUp => {
                jobs.failed.push_back(id);
                evict(&mut jobs.failed, &mut jobs.entries, self.config.keep_failed);
            }
        }
    }

    fn release_after(self: &Arc<Self>, id: Uuid, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            queue.release(id).await;
        });
    }

    /// Move a delayed job back to the waiting line.
    async fn release(&self, id: Uuid) {
        let mut guard = self.jobs.lock().await;
        let jobs = &mut *guard;
        let Some(entry) = jobs.entries.get_mut(&id) else {
            return;
        };
        if entry.job.state != JobState::Delayed {
            return;
        }
        let kind = entry.job.kind;
        entry.set_state(JobState::Waiting);
        jobs.push_waiting(kind, id);
        drop(guard);
        self.wake(kind);
    }

    async fn stats(&self) -> QueueStats {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats {
            paused: jobs.paused,
            ..QueueStats::default()
        };
        for entry in jobs.entries.values() {
            match entry.job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }
        stats
    }
}

async fn run_worker(
    queue: Arc<Queue>,
    kind: JobKind,
    slot: usize,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
) {
    let Some(notify) = queue.notifies.get(&kind).cloned() else {
        return;
    };
    debug!(queue = %queue.name, kind = %kind, slot, "Worker started");

    loop {
        // Registered before claiming so a wake-up between the two is not lost.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if token.is_cancelled() {
            break;
        }

        match queue.claim(kind).await {
            Some(job) => {
                debug!(queue = %queue.name, job_id = %job.id, attempt = job.attempts_made, "Job active");
                let outcome = match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err("handler panicked".to_string()),
                };
                queue.settle(job.id, outcome).await;
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = &mut notified => {}
                }
            }
        }
    }

    debug!(queue = %queue.name, kind = %kind, slot, "Worker stopped");
}

/// Owns every queue and its worker lanes.
pub struct QueueManager {
    queues: RwLock<HashMap<QueueName, Arc<Queue>>>,
    shutdown: CancellationToken,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create all named queues from `config_for`.
    pub async fn with_queues(
        config_for: impl Fn(QueueName) -> QueueConfig,
    ) -> Result<Self, QueueError> {
        let manager = Self::new();
        for name in QueueName::ALL {
            manager.create_queue(name, config_for(name)).await?;
        }
        Ok(manager)
    }

    pub async fn create_queue(&self, name: QueueName, config: QueueConfig) -> Result<(), QueueError> {
        let mut queues = self.queues.write().await;
        if queues.contains_key(&name) {
            return Err(QueueError::QueueExists(name));
        }
        info!(queue = %name, concurrency = config.concurrency, max_attempts = config.max_attempts, "Queue created");
        queues.insert(name, Arc::new(Queue::new(name, config, self.shutdown.clone())));
        Ok(())
    }

    async fn queue(&self, name: QueueName) -> Result<Arc<Queue>, QueueError> {
        self.queues
            .read()
            .await
            .get(&name)
            .cloned()
            .ok_or(QueueError::UnknownQueue(name))
    }

    pub async fn queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.queues.read().await.keys().copied().collect();
        names.sort();
        names
    }

    pub async fn config(&self, name: QueueName) -> Result<QueueConfig, QueueError> {
        Ok(self.queue(name).await?.config.clone())
    }

    /// Start `concurrency` workers for `kind` on `queue`, replacing any
    /// workers registered before. Replaced workers finish their current job.
    pub async fn register_handler(
        &self,
        queue: QueueName,
        kind: JobKind,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if kind.queue() != queue {
            return Err(ValidationError::WrongQueue { kind, queue }.into());
        }
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let q = self.queue(queue).await?;
        let concurrency = concurrency.max(1);
        let token = self.shutdown.child_token();

        let mut lanes = q.lanes.lock().await;
        if let Some(previous) = lanes.insert(
            kind,
            Lane {
                concurrency,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
            debug!(queue = %queue, kind = %kind, previous = previous.concurrency, "Replacing handler");
        }
        drop(lanes);

        for slot in 0..concurrency {
            tokio::spawn(run_worker(
                Arc::clone(&q),
                kind,
                slot,
                Arc::clone(&handler),
                token.clone(),
            ));
        }
        info!(queue = %queue, kind = %kind, concurrency, "Handler registered");
        Ok(())
    }

    /// Register every kind with the concurrency of its queue.
    pub async fn install(&self, handlers: &Handlers) -> Result<(), QueueError> {
        for kind in JobKind::ALL {
            let queue = kind.queue();
            let concurrency = self.queue(queue).await?.config.concurrency;
            self.register_handler(queue, kind, concurrency, handlers.for_kind(kind))
                .await?;
        }
        Ok(())
    }

    /// Validate and admit a job. Invalid payloads never reach a worker.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let q = self.queue(queue).await?;
        payload.validate(queue)?;

        let kind = payload.kind();
        let id = Uuid::new_v4();
        let initial = match options.delay {
            Some(delay) if !delay.is_zero() => JobState::Delayed,
            _ => JobState::Waiting,
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let job = Job {
            id,
            queue,
            kind,
            payload,
            state: initial,
            attempts_made: 0,
            retry: options.retry.unwrap_or_else(|| q.config.retry_policy()),
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
        };

        {
            let mut jobs = q.jobs.lock().await;
            jobs.entries.insert(id, Entry { job, state_tx });
            if initial == JobState::Waiting {
                jobs.push_waiting(kind, id);
            }
        }
        debug!(queue = %queue, job_id = %id, kind = %kind, state = ?initial, "Job enqueued");

        match options.delay {
            Some(delay) if !delay.is_zero() => q.release_after(id, delay),
            _ => q.wake(kind),
        }

        Ok(JobHandle::new(id, queue, state_rx))
    }

    pub async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        Ok(self.queue(queue).await?.stats().await)
    }

    pub async fn all_stats(&self) -> BTreeMap<QueueName, QueueStats> {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        let mut out = BTreeMap::new();
        for q in queues {
            out.insert(q.name, q.stats().await);
        }
        out
    }

    /// Stop admitting waiting jobs to workers. Active jobs run to completion.
    pub async fn pause(&self, queue: QueueName) -> Result<(), QueueError> {
        let q = self.queue(queue).await?;
        q.jobs.lock().await.paused = true;
        info!(queue = %queue, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue: QueueName) -> Result<(), QueueError> {
        let q = self.queue(queue).await?;
        q.jobs.lock().await.paused = false;
        q.wake_all();
        info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    pub async fn get_job(&self, queue: QueueName, id: Uuid) -> Result<Job, QueueError> {
        let q = self.queue(queue).await?;
        let jobs = q.jobs.lock().await;
        jobs.entries
            .get(&id)
            .map(|e| e.job.clone())
            .ok_or(QueueError::JobNotFound { queue, id })
    }

    /// Jobs of a queue, optionally filtered by state, oldest first.
    pub async fn jobs(&self, queue: QueueName, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        let q = self.queue(queue).await?;
        let jobs = q.jobs.lock().await;
        let mut out: Vec<Job> = jobs
            .entries
            .values()
            .filter(|e| state.map_or(true, |s| e.job.state == s))
            .map(|e| e.job.clone())
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    /// Remove a job that is not currently running.
    pub async fn remove_job(&self, queue: QueueName, id: Uuid) -> Result<(), QueueError> {
        let q = self.queue(queue).await?;
        let mut jobs = q.jobs.lock().await;
        match jobs.entries.get(&id).map(|e| e.job.state) {
            None => Err(QueueError::JobNotFound { queue, id }),
            Some(JobState::Active) => Err(QueueError::JobActive { queue, id }),
            Some(_) => {
                jobs.forget(id);
                debug!(queue = %queue, job_id = %id, "Job removed");
                Ok(())
            }
        }
    }

    /// Drop completed and failed jobs that finished more than `age` ago.
    pub async fn purge_old(&self, queue: QueueName, age: Duration) -> Result<usize, QueueError> {
        let q = self.queue(queue).await?;
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut jobs = q.jobs.lock().await;
        let stale: Vec<Uuid> = jobs
            .entries
            .values()
            .filter(|e| e.job.state.is_terminal())
            .filter(|e| e.job.finished_at.is_some_and(|at| at <= cutoff))
            .map(|e| e.job.id)
            .collect();
        for id in &stale {
            jobs.forget(*id);
        }
        if !stale.is_empty() {
            info!(queue = %queue, purged = stale.len(), "Purged old jobs");
        }
        Ok(stale.len())
    }

    /// Stop all workers and refuse new jobs. Running handlers are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
