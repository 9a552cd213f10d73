//! Producer side of the job queue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use backoffice_core::AppResult;

use super::payload::JobPayload;
use super::store::{JobStats, JobStore};
use super::types::{EnqueueOptions, Job, JobId};

/// Named queue handle used by services to offload work.
///
/// Cheap to clone; all clones share the same store.
#[derive(Clone)]
pub struct JobQueue {
    name: Arc<str>,
    store: Arc<dyn JobStore>,
    defaults: EnqueueOptions,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(name: &str, store: Arc<dyn JobStore>, defaults: EnqueueOptions) -> Self {
        Self {
            name: Arc::from(name),
            store,
            defaults,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn defaults(&self) -> &EnqueueOptions {
        &self.defaults
    }

    /// Enqueue with the queue's default options.
    pub async fn enqueue(&self, payload: JobPayload) -> AppResult<JobId> {
        self.enqueue_with(payload, self.defaults.clone()).await
    }

    #[instrument(skip(self, payload, options), fields(queue = %self.name, job_type = %payload.tag()))]
    pub async fn enqueue_with(&self, payload: JobPayload, options: EnqueueOptions) -> AppResult<JobId> {
        let envelope = payload.to_envelope()?;
        let job = Job::new(envelope, &options, Utc::now());
        let id = self.store.enqueue(job).await?;
        info!(queue = %self.name, job_id = %id, job_type = %payload.tag(), "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> AppResult<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> AppResult<Vec<Job>> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    /// Give a dead-lettered job a fresh attempt budget.
    pub async fn retry_dead_letter(&self, id: JobId) -> AppResult<Job> {
        let job = self.store.retry_dead_letter(id, Utc::now()).await?;
        info!(queue = %self.name, job_id = %id, "dead-lettered job re-queued");
        Ok(job)
    }

    pub async fn delete_dead_letter(&self, id: JobId) -> AppResult<()> {
        Ok(self.store.delete_dead_letter(id).await?)
    }

    pub async fn stats(&self) -> AppResult<JobStats> {
        Ok(self.store.stats().await?)
    }
}
