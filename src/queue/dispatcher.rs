//! Queue dispatcher - bounded worker pool over a priority queue

use crate::core::config::QueueConfig;
use crate::events::{EventPublisher, NotificationLevel};
use crate::queue::{JobOptions, JobOutcome, JobPayload, JobState, JobWorker, QueueError, QueueJob};
use anyhow::anyhow;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueueJob>,
    /// (priority, submission sequence, id), smallest first
    waiting: BinaryHeap<Reverse<(i32, u64, Uuid)>>,
    sequence: u64,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    closed: bool,
}

impl QueueState {
    fn push_waiting(&mut self, id: Uuid, priority: i32) {
        self.sequence += 1;
        self.waiting.push(Reverse((priority, self.sequence, id)));
    }

    /// Pop the next waiting job and mark it active
    fn take_next(&mut self) -> Option<QueueJob> {
        while let Some(Reverse((_, _, id))) = self.waiting.pop() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.state != JobState::Waiting {
                continue;
            }
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.progress = 0;
            job.updated_at = Utc::now();
            return Some(job.clone());
        }
        None
    }

    fn retain(history: &mut VecDeque<Uuid>, jobs: &mut HashMap<Uuid, QueueJob>, limit: usize) {
        while history.len() > limit {
            if let Some(evicted) = history.pop_front() {
                jobs.remove(&evicted);
            }
        }
    }
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    changes: watch::Sender<u64>,
    events: Option<EventPublisher>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn changed(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Record the result of one attempt
    async fn settle(self: &Arc<Self>, job_id: Uuid, result: anyhow::Result<JobOutcome>) {
        let mut exhausted = None;
        {
            let mut state = self.lock();
            let state = &mut *state;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            job.updated_at = Utc::now();

            match result {
                Ok(outcome) => {
                    info!(
                        "Job {} completed (execution {}, {})",
                        job_id,
                        outcome.execution_id,
                        outcome.status.as_str()
                    );
                    job.state = JobState::Completed;
                    job.progress = 100;
                    job.outcome = Some(outcome);
                    state.completed.push_back(job_id);
                    QueueState::retain(&mut state.completed, &mut state.jobs, self.config.retain_completed);
                }
                Err(e) => {
                    job.last_error = Some(format!("{:#}", e));

                    if job.attempts_made >= job.options.max_attempts {
                        job.state = JobState::Failed;
                        if let Some(err) = job.exhausted_error() {
                            error!("{}", err);
                            exhausted = Some((job.payload.triggered_by.clone(), err.to_string()));
                        }
                        state.failed.push_back(job_id);
                        QueueState::retain(&mut state.failed, &mut state.jobs, self.config.retain_failed);
                    } else {
                        let delay = job.options.backoff.delay(job.attempts_made);
                        warn!(
                            "Job {} attempt {}/{} failed, retrying in {:?}: {:#}",
                            job_id, job.attempts_made, job.options.max_attempts, delay, e
                        );
                        job.state = JobState::Delayed;
                        job.run_at = chrono::Duration::from_std(delay)
                            .ok()
                            .map(|d| Utc::now() + d);

                        let shared = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            shared.promote(job_id);
                        });
                    }
                }
            }
        }
        self.changed();

        if let (Some(events), Some((user, message))) = (&self.events, exhausted) {
            events
                .notify(user.as_deref(), NotificationLevel::Error, "Pipeline run failed", message)
                .await;
        }
    }

    /// Move a delayed job back to waiting
    fn promote(&self, job_id: Uuid) {
        {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Delayed {
                return;
            }
            job.state = JobState::Waiting;
            job.run_at = None;
            job.updated_at = Utc::now();
            let priority = job.options.priority;
            state.push_waiting(job_id, priority);
        }
        debug!("Job {} is eligible again", job_id);
        self.notify.notify_one();
        self.changed();
    }
}

/// Reporting handle given to a worker for one attempt
#[derive(Clone)]
pub struct JobHandle {
    job_id: Uuid,
    shared: Arc<Shared>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Report 0-100 progress of the current attempt
    pub fn set_progress(&self, percent: u8) {
        {
            let mut state = self.shared.lock();
            if let Some(job) = state.jobs.get_mut(&self.job_id) {
                job.progress = percent.min(100);
                job.updated_at = Utc::now();
            }
        }
        self.shared.changed();
    }

    /// Remember an execution record created by this attempt
    pub fn record_execution(&self, execution_id: Uuid) {
        {
            let mut state = self.shared.lock();
            if let Some(job) = state.jobs.get_mut(&self.job_id) {
                job.execution_ids.push(execution_id);
            }
        }
        self.shared.changed();
    }
}

/// Runs queued jobs on a bounded pool of workers
pub struct QueueDispatcher {
    shared: Arc<Shared>,
    worker: Arc<dyn JobWorker>,
    semaphore: Arc<Semaphore>,
    workers: usize,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl QueueDispatcher {
    pub fn new(config: QueueConfig, workers: usize, worker: Arc<dyn JobWorker>) -> Self {
        let workers = workers.max(1);
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                changes,
                events: None,
            }),
            worker,
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            runner: Mutex::new(None),
        }
    }

    /// Publish a notification when a job runs out of attempts
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.events = Some(events);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Default options for jobs submitted without any
    pub fn default_options(&self) -> JobOptions {
        JobOptions::from_config(&self.shared.config)
    }

    /// Start picking up jobs; calling it again has no effect
    pub fn start(&self) {
        let mut runner = match self.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runner.is_some() {
            return;
        }

        info!(
            "Starting queue '{}' with {} worker(s)",
            self.shared.config.name, self.workers
        );
        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&self.worker);
        let semaphore = Arc::clone(&self.semaphore);
        *runner = Some(tokio::spawn(Self::dispatch_loop(shared, worker, semaphore)));
    }

    async fn dispatch_loop(shared: Arc<Shared>, worker: Arc<dyn JobWorker>, semaphore: Arc<Semaphore>) {
        loop {
            // Backpressure: a job is only taken once a worker slot is free
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                return;
            };

            let job = loop {
                {
                    let mut state = shared.lock();
                    if state.closed {
                        return;
                    }
                    if let Some(job) = state.take_next() {
                        break job;
                    }
                }
                shared.notify.notified().await;
            };
            shared.changed();

            debug!("Picked up job {} (attempt {})", job.id, job.attempts_made);
            tokio::spawn(Self::run_job(
                Arc::clone(&shared),
                Arc::clone(&worker),
                job,
                permit,
            ));
        }
    }

    async fn run_job(shared: Arc<Shared>, worker: Arc<dyn JobWorker>, job: QueueJob, permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        let handle = JobHandle {
            job_id,
            shared: Arc::clone(&shared),
        };

        // Inner task so a panicking worker is reported like any other failure
        let result = match tokio::spawn(async move { worker.process(&job, handle).await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("worker panicked: {}", e)),
        };

        shared.settle(job_id, result).await;
        drop(permit);
    }

    /// Submit a job; returns its id immediately
    pub fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<Uuid, QueueError> {
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidOptions("max_attempts must be at least 1".to_string()));
        }

        let job = QueueJob::new(&self.shared.config.name, payload, options);
        let id = job.id;
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(QueueError::Closed(self.shared.config.name.clone()));
            }
            state.jobs.insert(id, job);
            state.push_waiting(id, options.priority);
        }

        debug!("Enqueued job {} (priority {})", id, options.priority);
        self.shared.notify.notify_one();
        self.shared.changed();
        Ok(id)
    }

    /// Snapshot of a job; `None` once it is unknown or evicted from history
    pub fn job(&self, id: Uuid) -> Option<QueueJob> {
        self.shared.lock().jobs.get(&id).cloned()
    }

    /// Jobs in a state, oldest first
    pub fn jobs_in(&self, state: JobState) -> Vec<QueueJob> {
        let mut jobs: Vec<_> = self
            .shared
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let state = self.shared.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }
        counts
    }

    /// Wait until a job is completed or failed
    pub async fn wait_for_job(&self, id: Uuid) -> Option<QueueJob> {
        let mut changes = self.shared.changes.subscribe();
        loop {
            match self.job(id) {
                Some(job) if job.state.is_terminal() => return Some(job),
                Some(_) => {}
                None => return None,
            }
            if changes.changed().await.is_err() {
                return self.job(id);
            }
        }
    }

    /// Subscribe to job table changes (the value is a change counter)
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Stop taking jobs and wait for active ones to finish
    pub async fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();

        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                warn!("Queue runner ended abnormally: {}", e);
            }
        }

        let _drained = self.semaphore.acquire_many(self.workers as u32).await;
        info!("Queue '{}' stopped", self.shared.config.name);
    }
}
