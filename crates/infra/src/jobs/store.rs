//! Job storage implementations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use backoffice_core::AppError;

use super::types::{Job, JobId, JobStatus};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Enqueue a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Persist a job's new state.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Drop a finished job.
    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Claim the next claimable job due at `now`, marking it running under a lease of
    /// `lease`. Returns None if no jobs are available.
    async fn claim_next(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobStoreError>;

    /// Extend the lease of a running job. `false` when the job is no longer running
    /// (finished, or already recovered as stalled).
    async fn renew_lease(&self, job_id: JobId, locked_until: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Fail every running job whose lease expired before `now`, applying its retry policy.
    /// Returns the recovered jobs in their new state.
    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// List dead-lettered jobs, most recent first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Retry a dead-lettered job (move back to pending with a fresh attempt budget).
    async fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Delete a dead-lettered job.
    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} is not dead-lettered")]
    NotDeadLettered(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for AppError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => AppError::not_found(format!("job {id}")),
            JobStoreError::AlreadyExists(_) | JobStoreError::NotDeadLettered(_) => {
                AppError::Conflict(err.to_string())
            }
            JobStoreError::Storage(msg) => AppError::Storage(msg),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

/// In-memory job store for tests/dev.
///
/// Dead-lettered jobs stay in the same map with their terminal status.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.jobs.write().remove(&job_id);
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write();

        // Highest priority first, then due time, then creation order.
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_at.cmp(&b.run_at))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.0.cmp(&b.id.0))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(now, lease);
                job.clone()
            })
        }))
    }

    async fn renew_lease(&self, job_id: JobId, locked_until: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job_id) {
            Some(job) if matches!(job.status, JobStatus::Running) => {
                job.locked_until = Some(locked_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write();
        let mut recovered = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_stalled(now)) {
            job.recover_stalled(now);
            recovered.push(job.clone());
        }
        for job in &recovered {
            if job.remove_on_fail && matches!(job.status, JobStatus::DeadLettered { .. }) {
                jobs.remove(&job.id);
            }
        }
        Ok(recovered)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::DeadLettered { .. }))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            return Err(JobStoreError::NotDeadLettered(job_id));
        }
        job.reset_for_retry(now);
        Ok(job.clone())
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            return Err(JobStoreError::NotDeadLettered(job_id));
        }
        jobs.remove(&job_id);
        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(&job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{DEFAULT_LEASE, EnqueueOptions, JobEnvelope, RetryPolicy, STALLED_ERROR};

    fn job(now: DateTime<Utc>, priority: i32) -> Job {
        let options = EnqueueOptions {
            priority,
            ..Default::default()
        };
        Job::new(
            JobEnvelope {
                job_type: "TEST".to_string(),
                data: serde_json::json!({}),
            },
            &options,
            now,
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job_id = store.enqueue(job(now, 0)).await.unwrap();

        let claimed = store.claim_next(now, DEFAULT_LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next(now, DEFAULT_LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn higher_priority_is_claimed_first_then_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = store.enqueue(job(now, 0)).await.unwrap();
        let second = store
            .enqueue(job(now + chrono::Duration::milliseconds(1), 0))
            .await
            .unwrap();
        let urgent = store
            .enqueue(job(now + chrono::Duration::milliseconds(2), 10))
            .await
            .unwrap();

        let later = now + chrono::Duration::seconds(1);
        let order: Vec<JobId> = [
            store.claim_next(later, DEFAULT_LEASE).await.unwrap().unwrap().id,
            store.claim_next(later, DEFAULT_LEASE).await.unwrap().unwrap().id,
            store.claim_next(later, DEFAULT_LEASE).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![urgent, first, second]);
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut j = job(now, 0);
        j.retry_policy.max_attempts = 1;
        let job_id = store.enqueue(j).await.unwrap();

        let mut claimed = store.claim_next(now, DEFAULT_LEASE).await.unwrap().unwrap();
        claimed.mark_failed("test error".to_string(), now, now);
        store.update(&claimed).await.unwrap();

        // Retained, not claimable
        assert!(store.get(job_id).await.unwrap().is_some());
        assert!(store.claim_next(now, DEFAULT_LEASE).await.unwrap().is_none());

        let dls = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].id, job_id);

        let retried = store.retry_dead_letter(job_id, now).await.unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.attempt, 0);

        assert!(store.list_dead_letters(10).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_dead_letter(job_id).await,
            Err(JobStoreError::NotDeadLettered(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_its_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut j = job(now, 0);
        j.retry_policy = RetryPolicy::fixed(3, Duration::ZERO);
        let job_id = store.enqueue(j).await.unwrap();

        // Claimed by a worker that then disappears without reporting back.
        let lease = Duration::from_secs(30);
        store.claim_next(now, lease).await.unwrap().unwrap();
        assert!(store.claim_next(now, lease).await.unwrap().is_none());
        assert!(store.recover_stalled(now).await.unwrap().is_empty());

        let later = now + chrono::Duration::minutes(1);
        let recovered = store.recover_stalled(later).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(
            recovered[0].status,
            JobStatus::Failed {
                error: STALLED_ERROR.to_string(),
                attempt: 1
            }
        );

        let reclaimed = store.claim_next(later, lease).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(reclaimed.attempt, 2);
        assert_eq!(reclaimed.history.len(), 1);
    }

    #[tokio::test]
    async fn renewed_lease_keeps_a_job_running() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job_id = store.enqueue(job(now, 0)).await.unwrap();
        let lease = Duration::from_secs(30);
        store.claim_next(now, lease).await.unwrap().unwrap();

        let later = now + chrono::Duration::minutes(1);
        assert!(store.renew_lease(job_id, later + chrono::Duration::seconds(30)).await.unwrap());
        assert!(store.recover_stalled(later).await.unwrap().is_empty());
        assert!(matches!(
            store.get(job_id).await.unwrap().unwrap().status,
            JobStatus::Running
        ));

        store.remove(job_id).await.unwrap();
        assert!(!store.renew_lease(job_id, later).await.unwrap());
    }

    #[tokio::test]
    async fn stalled_job_out_of_attempts_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut j = job(now, 0);
        j.retry_policy = RetryPolicy::no_retry();
        let job_id = store.enqueue(j).await.unwrap();
        store.claim_next(now, DEFAULT_LEASE).await.unwrap().unwrap();

        store.recover_stalled(now + chrono::Duration::hours(1)).await.unwrap();
        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, job_id);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for _ in 0..5 {
            store.enqueue(job(now, 0)).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_next(now, DEFAULT_LEASE).await.unwrap();
        store.claim_next(now, DEFAULT_LEASE).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }
}
