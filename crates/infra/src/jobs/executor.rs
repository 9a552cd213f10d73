//! Worker pool with bounded concurrency, retry and dead-lettering.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::payload::{JobError, JobHandlers, JobPayload, dispatch};
use super::store::{JobStore, JobStoreError};
use super::types::{DEFAULT_LEASE, Job, JobId, JobStatus, after};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging
    pub name: String,
    /// Maximum simultaneous job executions
    pub concurrency: usize,
    /// How often to poll for new jobs when the queue is empty
    pub poll_interval: Duration,
    /// Upper bound on a single execution; exceeding it counts as a failed attempt
    pub job_timeout: Option<Duration>,
    /// Claim lease, renewed at half this interval while a job runs. Also the period of the
    /// stalled-job sweep.
    pub lease: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            concurrency: 5,
            poll_interval: Duration::from_millis(200),
            job_timeout: None,
            lease: DEFAULT_LEASE,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_recovered: u64,
    pub current_running: usize,
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { job_id: JobId },
    Retrying { job_id: JobId, attempt: u32, run_at: DateTime<Utc> },
    DeadLettered { job_id: JobId, attempts: u32 },
}

struct Shared<H: JobHandlers> {
    store: Arc<dyn JobStore>,
    handlers: Arc<H>,
    config: WorkerPoolConfig,
    stats: Mutex<ExecutorStats>,
}

/// Polls a job store and executes jobs with the registered handler table.
pub struct WorkerPool<H: JobHandlers> {
    shared: Arc<Shared<H>>,
}

impl<H: JobHandlers> Clone for WorkerPool<H> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<H: JobHandlers> WorkerPool<H> {
    pub fn new(store: Arc<dyn JobStore>, handlers: Arc<H>, config: WorkerPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                handlers,
                config,
                stats: Mutex::new(ExecutorStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.shared.stats.lock().clone()
    }

    /// Claim and execute at most one due job inline.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        match self
            .shared
            .store
            .claim_next(Utc::now(), self.shared.config.lease)
            .await?
        {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Return jobs whose worker stopped renewing its lease to the retry policy.
    pub async fn recover_stalled(&self) -> Result<usize, JobStoreError> {
        let recovered = self.shared.store.recover_stalled(Utc::now()).await?;
        for job in &recovered {
            warn!(
                worker = %self.shared.config.name,
                job_id = %job.id,
                job_type = %job.job_type(),
                attempt = job.attempt,
                status = job.status.label(),
                "recovered stalled job"
            );
        }
        self.shared.stats.lock().jobs_recovered += recovered.len() as u64;
        Ok(recovered.len())
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats_source = self.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            join,
            stats_source: Box::new(move || stats_source.stats()),
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.shared.config;
        let slots = config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        info!(worker = %config.name, concurrency = slots, "worker pool started");

        let mut next_sweep = tokio::time::Instant::now();
        loop {
            if tokio::time::Instant::now() >= next_sweep {
                if let Err(e) = self.recover_stalled().await {
                    error!(worker = %config.name, error = %e, "failed to recover stalled jobs");
                }
                next_sweep = tokio::time::Instant::now() + config.lease;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.shared.store.claim_next(Utc::now(), config.lease).await {
                Ok(Some(job)) => {
                    let pool = self.clone();
                    let span = info_span!("job", job_id = %job.id, job_type = %job.job_type());
                    tokio::spawn(
                        async move {
                            if let Err(e) = pool.execute(job).await {
                                error!(error = %e, "failed to record job outcome");
                            }
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker = %config.name, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
            }
        }

        // Drain: every slot free means every in-flight job has finished.
        let in_flight = slots - semaphore.available_permits();
        if in_flight > 0 {
            info!(worker = %config.name, in_flight, "draining in-flight jobs");
        }
        match u32::try_from(slots) {
            Ok(all) => match semaphore.acquire_many(all).await {
                Ok(_drained) => info!(worker = %config.name, "worker pool stopped"),
                Err(e) => error!(worker = %config.name, error = %e, "slot semaphore closed while draining"),
            },
            Err(_) => error!(worker = %config.name, slots, "too many slots to drain"),
        }
    }

    async fn execute(&self, mut job: Job) -> Result<JobOutcome, JobStoreError> {
        let shared = &self.shared;
        let started = Utc::now();
        shared.stats.lock().current_running += 1;

        debug!(
            worker = %shared.config.name,
            job_id = %job.id,
            job_type = %job.job_type(),
            attempt = job.attempt,
            "executing job"
        );

        let job_id = job.id;
        let result = {
            let work = async {
                match JobPayload::from_envelope(&job.envelope) {
                    Ok(payload) => {
                        let run = dispatch(&*shared.handlers, payload);
                        match shared.config.job_timeout {
                            Some(limit) => match tokio::time::timeout(limit, run).await {
                                Ok(result) => result.map_err(|e| e.to_string()),
                                Err(_) => Err(JobError::TimedOut(limit).to_string()),
                            },
                            None => run.await.map_err(|e| e.to_string()),
                        }
                    }
                    Err(e) => Err(e.to_string()),
                }
            };
            let mut work = pin!(work);
            tokio::select! {
                result = &mut work => result,
                () = self.keep_lease(job_id) => work.await,
            }
        };

        let now = Utc::now();
        let outcome = match result {
            Ok(()) => {
                job.mark_completed(started, now);
                if job.remove_on_complete {
                    shared.store.remove(job.id).await?;
                } else {
                    shared.store.update(&job).await?;
                }
                info!(job_id = %job.id, job_type = %job.job_type(), "job completed");
                JobOutcome::Completed { job_id: job.id }
            }
            Err(error) => {
                job.mark_failed(error.clone(), started, now);
                match &job.status {
                    JobStatus::DeadLettered { attempts, .. } => {
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type(),
                            attempts,
                            error = %error,
                            "job exhausted its attempts"
                        );
                        let attempts = *attempts;
                        if job.remove_on_fail {
                            shared.store.remove(job.id).await?;
                        } else {
                            shared.store.update(&job).await?;
                        }
                        JobOutcome::DeadLettered {
                            job_id: job.id,
                            attempts,
                        }
                    }
                    _ => {
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type(),
                            attempt = job.attempt,
                            run_at = %job.run_at,
                            error = %error,
                            "job failed; retry scheduled"
                        );
                        shared.store.update(&job).await?;
                        JobOutcome::Retrying {
                            job_id: job.id,
                            attempt: job.attempt,
                            run_at: job.run_at,
                        }
                    }
                }
            }
        };

        let mut stats = shared.stats.lock();
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed { .. } => stats.jobs_succeeded += 1,
            JobOutcome::Retrying { .. } => stats.jobs_failed += 1,
            JobOutcome::DeadLettered { .. } => {
                stats.jobs_failed += 1;
                stats.jobs_dead_lettered += 1;
            }
        }
        Ok(outcome)
    }
}

impl<H: JobHandlers> WorkerPool<H> {
    /// Renew the claim lease until the lease is lost. Never completes while it holds.
    async fn keep_lease(&self, job_id: JobId) {
        let lease = self.shared.config.lease;
        let period = (lease / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match self.shared.store.renew_lease(job_id, after(Utc::now(), lease)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job_id, "job lease lost; it may run again elsewhere");
                    return;
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to renew job lease"),
            }
        }
    }
}

/// Handle to control a running worker pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats_source: Box<dyn Fn() -> ExecutorStats + Send + Sync>,
}

impl std::fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolHandle").finish_non_exhaustive()
    }
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker pool task panicked");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        (self.stats_source)()
    }
}
