//! Job executor: K worker threads plus a stuck-job sweeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::JobSettings;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobKind, JobProgress, JobResult, JobStatus};

/// What a running handler can see of its job.
pub struct JobContext {
    job_id: JobId,
    cancel: CancelToken,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Store progress on the job, refreshing its heartbeat.
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let progress = JobProgress {
            percent,
            message: message.into(),
        };
        if let Err(err) = self.store.heartbeat(self.job_id, Some(progress)) {
            warn!(job_id = %self.job_id, error = %err, "failed to record job progress");
        }
    }
}

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job, &JobContext) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often idle workers poll for new jobs
    pub poll_interval: Duration,
    pub workers: usize,
    /// Overall budget of one job
    pub job_timeout: Duration,
    /// Running jobs without a heartbeat for this long are removed
    pub heartbeat_threshold: Duration,
    pub sweep_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self::from(&JobSettings::default())
    }
}

impl From<&JobSettings> for JobExecutorConfig {
    fn from(settings: &JobSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            workers: settings.workers.max(1),
            job_timeout: Duration::from_secs(settings.job_timeout_secs),
            heartbeat_threshold: Duration::from_secs(settings.heartbeat_threshold_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// How often the executor beats for a running job.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_threshold / 3).max(Duration::from_millis(1))
    }
}

/// Cancel tokens of the jobs currently running in this process.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<JobId, CancelToken>>>,
}

impl CancelRegistry {
    fn insert(&self, id: JobId, token: CancelToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, token);
        }
    }

    fn remove(&self, id: JobId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&id);
        }
    }

    /// Signal a running job. Returns whether it was running here.
    pub fn cancel(&self, id: JobId) -> bool {
        self.tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&id).cloned())
            .map(|token| token.cancel())
            .is_some()
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    cancels: CancelRegistry,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for running jobs.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub stale_removed: u64,
    pub current_running: usize,
}

/// Background job executor.
///
/// Workers poll the store for queued jobs and run them with the registered
/// handler; the sweeper removes running jobs that stopped beating.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: HashMap<&'static str, JobHandler>,
    cancels: CancelRegistry,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            cancels: CancelRegistry::default(),
        }
    }

    /// Tokens of the jobs this executor is running.
    pub fn cancels(&self) -> CancelRegistry {
        self.cancels.clone()
    }

    /// Register the handler of one job type (see [`JobKind::type_name`]).
    pub fn register_handler<F>(&mut self, type_name: &'static str, handler: F)
    where
        F: Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(type_name, Box::new(handler));
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        self.handlers.get(kind.type_name())
    }

    /// Spawn the workers and the sweeper.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let cancels = self.cancels.clone();
        let executor = Arc::new(self);

        let mut threads = Vec::with_capacity(config.workers + 1);
        for n in 0..config.workers {
            let worker = Worker {
                executor: executor.clone(),
                config: config.clone(),
                shutdown: shutdown.clone(),
                stats: stats.clone(),
                cancels: cancels.clone(),
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("{}-{n}", config.name))
                    .spawn(move || worker.run())?,
            );
        }

        let store = executor.store.clone();
        let sweeper = Sweeper {
            store,
            config: config.clone(),
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            cancels: cancels.clone(),
        };
        threads.push(
            thread::Builder::new()
                .name(format!("{}-sweep", config.name))
                .spawn(move || sweeper.run())?,
        );

        info!(executor = %config.name, workers = config.workers, "job executor started");
        Ok(JobExecutorHandle {
            shutdown,
            threads,
            stats,
            cancels,
        })
    }

    /// Claim and execute one job on the calling thread.
    pub fn run_next(&self, job_timeout: Duration) -> Result<Option<Job>, JobStoreError> {
        let Some(mut job) = self.store.claim_next()? else {
            return Ok(None);
        };
        let cancel = CancelToken::with_timeout(job_timeout);
        self.cancels.insert(job.id, cancel.clone());
        let beat_every = JobExecutorConfig::default().heartbeat_interval();
        let outcome = self.execute(&mut job, cancel, beat_every);
        self.cancels.remove(job.id);
        outcome.map(|()| Some(job))
    }

    fn execute(&self, job: &mut Job, cancel: CancelToken, beat_every: Duration) -> Result<(), JobStoreError> {
        let started = job.started_at.unwrap_or_else(Utc::now);
        let Some(handler) = self.get_handler(&job.kind) else {
            let error = format!("no handler for job kind: {}", job.kind.type_name());
            warn!(job_id = %job.id, error = %error, "no handler for job");
            job.mark_failed(error, started);
            return self.store.update(job);
        };

        let context = JobContext {
            job_id: job.id,
            cancel,
            store: self.store.clone(),
        };
        let result = self.with_heartbeat(job.id, beat_every, || handler(&*job, &context));

        // progress written by the handler lives in the store
        if let Some(stored) = self.store.get(job.id)? {
            job.progress = stored.progress;
            job.heartbeat_at = stored.heartbeat_at;
        }
        match result {
            JobResult::Success(result) => {
                job.mark_finished(started, result);
                debug!(job_id = %job.id, "job finished");
            }
            JobResult::Failure(error) => {
                warn!(job_id = %job.id, error = %error, "job failed");
                job.mark_failed(error, started);
            }
            JobResult::Cancelled => {
                info!(job_id = %job.id, "job cancelled");
                job.mark_cancelled(Some(started));
            }
        }
        self.store.update(job)
    }

    /// Run `f` while a ticker refreshes the job's heartbeat every `every`.
    fn with_heartbeat<T>(&self, job_id: JobId, every: Duration, f: impl FnOnce() -> T) -> T {
        let (done, stopped) = mpsc::channel::<()>();
        thread::scope(|scope| {
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(every) {
                    if let Err(err) = self.store.heartbeat(job_id, None) {
                        warn!(job_id = %job_id, error = %err, "failed to record heartbeat");
                        break;
                    }
                }
            });
            let result = f();
            drop(done);
            result
        })
    }
}

struct Worker {
    executor: Arc<JobExecutor>,
    config: JobExecutorConfig,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<ExecutorStats>>,
    cancels: CancelRegistry,
}

impl Worker {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.executor.store.claim_next() {
                Ok(Some(mut job)) => {
                    debug!(executor = %self.config.name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
                    self.with_stats(|s| s.current_running += 1);

                    let cancel = CancelToken::with_timeout(self.config.job_timeout);
                    self.cancels.insert(job.id, cancel.clone());
                    let outcome = self.executor.execute(&mut job, cancel, self.config.heartbeat_interval());
                    self.cancels.remove(job.id);

                    self.with_stats(|s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.jobs_processed += 1;
                        match job.status {
                            JobStatus::Finished => s.jobs_succeeded += 1,
                            JobStatus::Cancelled => s.jobs_cancelled += 1,
                            _ => s.jobs_failed += 1,
                        }
                    });
                    if let Err(err) = outcome {
                        // e.g. removed by the sweeper while running
                        warn!(job_id = %job.id, error = %err, "failed to store job outcome");
                    }
                }
                Ok(None) => thread::sleep(self.config.poll_interval),
                Err(err) => {
                    error!(executor = %self.config.name, error = %err, "failed to claim job");
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
        debug!(executor = %self.config.name, "worker stopped");
    }

    fn with_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

struct Sweeper {
    store: Arc<dyn JobStore>,
    config: JobExecutorConfig,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<ExecutorStats>>,
    cancels: CancelRegistry,
}

impl Sweeper {
    fn run(self) {
        let tick = self.config.poll_interval.min(self.config.sweep_interval).max(Duration::from_millis(10));
        let mut last = Instant::now();
        while !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(tick);
            if last.elapsed() < self.config.sweep_interval {
                continue;
            }
            last = Instant::now();
            match stuck_cleanup(self.store.as_ref(), self.config.heartbeat_threshold) {
                Ok(removed) => {
                    for job in &removed {
                        self.cancels.cancel(job.id);
                    }
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.stale_removed += removed.len() as u64;
                    }
                }
                Err(err) => error!(error = %err, "stuck job sweep failed"),
            }
        }
    }
}

/// Remove running jobs whose heartbeat is older than `threshold`.
pub fn stuck_cleanup(store: &dyn JobStore, threshold: Duration) -> Result<Vec<Job>, JobStoreError> {
    let removed = store.remove_stale(threshold)?;
    for job in &removed {
        warn!(
            job_id = %job.id,
            company = %job.company_alias(),
            heartbeat = ?job.heartbeat_at,
            "removed stuck job"
        );
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn executor_with(handler: impl Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static) -> (Arc<InMemoryJobStore>, JobExecutor) {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("sync_company", handler);
        (store, executor)
    }

    #[test]
    fn execute_successful_job() {
        let (store, executor) = executor_with(|_job, ctx| {
            ctx.progress(50, "halfway");
            JobResult::Success(Some(serde_json::json!({"ok": true})))
        });
        let id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        let job = executor.run_next(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Finished);

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.progress.percent, 100);
        assert_eq!(stored.history.len(), 1);
    }

    #[test]
    fn failing_job_records_error() {
        let (store, executor) = executor_with(|_job, _ctx| JobResult::Failure("erp down".into()));
        let id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        executor.run_next(Duration::from_secs(60)).unwrap();
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed { error: "erp down".into() });
    }

    #[test]
    fn timeout_reaches_handler_through_token() {
        let (store, executor) = executor_with(|_job, ctx| match ctx.cancel_token().check() {
            Ok(()) => JobResult::Success(None),
            Err(_) => JobResult::Failure("timed out".into()),
        });
        store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        let job = executor.run_next(Duration::ZERO).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Failed { .. }));
    }

    #[test]
    fn workers_drain_the_queue() {
        let (store, executor) = executor_with(|_job, _ctx| JobResult::Success(None));
        for alias in ["a", "b", "c"] {
            store.enqueue(Job::new(JobKind::sync_company(alias))).unwrap();
        }

        let config = JobExecutorConfig::default().with_workers(2);
        let config = JobExecutorConfig {
            poll_interval: Duration::from_millis(5),
            ..config
        };
        let handle = executor.spawn(config).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().finished < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        assert_eq!(store.stats().unwrap().finished, 3);
    }

    #[test]
    fn cleanup_removes_only_stale_jobs() {
        let store = InMemoryJobStore::arc();
        store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();
        let mut job = store.claim_next().unwrap().unwrap();
        job.heartbeat_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.update(&job).unwrap();

        let removed = stuck_cleanup(store.as_ref(), Duration::from_secs(600)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.stats().unwrap().running, 0);
    }

    #[test]
    fn quiet_long_job_survives_the_sweep() {
        let (store, executor) = executor_with(|_job, ctx| {
            thread::sleep(Duration::from_millis(400));
            match ctx.cancel_token().check() {
                Ok(()) => JobResult::Success(None),
                Err(_) => JobResult::Failure("interrupted".into()),
            }
        });
        let id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        let config = JobExecutorConfig {
            poll_interval: Duration::from_millis(5),
            heartbeat_threshold: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(10),
            ..JobExecutorConfig::default().with_workers(1)
        };
        let handle = executor.spawn(config).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_processed < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Finished);
        assert_eq!(stats.stale_removed, 0);
        assert_eq!(stats.jobs_succeeded, 1);
    }
}
