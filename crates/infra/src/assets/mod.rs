//! External asset storage (images, ticket attachments) behind circuit breakers.
//!
//! The storage service is treated as an opaque remote dependency. [`GuardedAssetStorage`]
//! is what services use: uploads fall back to a local placeholder when the store is
//! unavailable, and deletes that cannot be performed are queued as `ASSET_CLEANUP` jobs.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use backoffice_core::{AppError, AppResult, ExternalFailure};

use crate::jobs::{AssetCleanupJob, JobPayload, JobQueue};
use crate::resilience::{BreakerConfig, BreakerRegistry, CircuitBreaker, Outcome};

pub use in_memory::InMemoryAssetStorage;

/// Prefix of public ids handed out by the upload fallback.
pub const FALLBACK_PREFIX: &str = "fallback-";

fn is_false(b: &bool) -> bool {
    !*b
}

/// Reference to a stored asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAsset {
    pub url: String,
    pub public_id: String,
    /// Set when the asset store was unavailable and a local placeholder was recorded.
    #[serde(default, skip_serializing_if = "is_false")]
    pub fallback: bool,
}

impl StoredAsset {
    fn placeholder() -> Self {
        let ts = Utc::now().timestamp_millis();
        Self {
            url: format!("/uploads/{FALLBACK_PREFIX}{ts}.jpg"),
            public_id: format!("{FALLBACK_PREFIX}{ts}"),
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpload {
    pub folder: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl AssetUpload {
    pub fn new(folder: impl Into<String>, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            folder: folder.into(),
            file_name: file_name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    /// The store could not be reached; an `ASSET_CLEANUP` job will retry the delete.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("upload has no content")]
    EmptyUpload,

    #[error("asset store rejected the request: {0}")]
    Rejected(String),

    #[error("asset store unavailable: {0}")]
    Unavailable(String),
}

impl From<AssetError> for AppError {
    fn from(err: AssetError) -> Self {
        match err {
            AssetError::EmptyUpload => AppError::validation(err.to_string()),
            other => AppError::ExternalService {
                service: "asset-storage".to_string(),
                failure: ExternalFailure::Failed(other.to_string()),
                fallback_used: false,
            },
        }
    }
}

/// Remote object store for binary assets.
#[async_trait]
pub trait AssetStorage: Send + Sync + 'static {
    async fn upload(&self, upload: &AssetUpload) -> Result<StoredAsset, AssetError>;

    async fn delete(&self, public_id: &str) -> Result<(), AssetError>;
}

/// Asset storage wrapped in the `asset-upload` and `asset-delete` breakers.
#[derive(Clone)]
pub struct GuardedAssetStorage {
    inner: Arc<dyn AssetStorage>,
    upload_breaker: Arc<CircuitBreaker>,
    delete_breaker: Arc<CircuitBreaker>,
    cleanup: JobQueue,
}

impl std::fmt::Debug for GuardedAssetStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedAssetStorage")
            .field("upload_breaker", &self.upload_breaker.name())
            .field("delete_breaker", &self.delete_breaker.name())
            .finish_non_exhaustive()
    }
}

impl GuardedAssetStorage {
    pub fn new(
        inner: Arc<dyn AssetStorage>,
        registry: &BreakerRegistry,
        upload: BreakerConfig,
        delete: BreakerConfig,
        cleanup: JobQueue,
    ) -> Self {
        Self {
            inner,
            upload_breaker: registry.register(upload),
            delete_breaker: registry.register(delete),
            cleanup,
        }
    }

    /// Upload through the breaker. When the store is unavailable the result is a
    /// placeholder asset flagged `fallback`, tagged [`Outcome::Degraded`].
    pub async fn upload(&self, upload: &AssetUpload) -> AppResult<Outcome<StoredAsset>> {
        if upload.bytes.is_empty() {
            return Err(AssetError::EmptyUpload.into());
        }
        let outcome = self
            .upload_breaker
            .call_with_fallback(
                || self.inner.upload(upload),
                |trigger| async move {
                    warn!(folder = %upload.folder, trigger = %trigger, "asset upload failed; using local placeholder");
                    Ok(StoredAsset::placeholder())
                },
            )
            .await?;
        if let Outcome::Genuine(asset) = &outcome {
            info!(public_id = %asset.public_id, "asset uploaded");
        }
        Ok(outcome)
    }

    /// Delete through the breaker; if the store cannot be reached the delete is queued
    /// for the worker pool instead of failing the caller.
    pub async fn delete(&self, public_id: &str) -> AppResult<DeleteStatus> {
        if public_id.starts_with(FALLBACK_PREFIX) {
            return Ok(DeleteStatus::Deleted);
        }
        let outcome = self
            .delete_breaker
            .call_with_fallback(
                || self.inner.delete(public_id),
                |trigger| async move {
                    warn!(public_id, trigger = %trigger, "asset delete failed; queueing cleanup");
                    self.cleanup
                        .enqueue(JobPayload::AssetCleanup(AssetCleanupJob {
                            public_id: public_id.to_string(),
                        }))
                        .await
                        .map_err(|e| AssetError::Unavailable(format!("cleanup not queued: {e}")))?;
                    Ok(())
                },
            )
            .await?;
        Ok(match outcome {
            Outcome::Genuine(()) => DeleteStatus::Deleted,
            Outcome::Degraded(()) => DeleteStatus::Queued,
        })
    }

    /// Delete through the breaker without a fallback. Used by the cleanup job, whose retry
    /// policy takes over on failure.
    pub async fn delete_now(&self, public_id: &str) -> AppResult<()> {
        if public_id.starts_with(FALLBACK_PREFIX) {
            return Ok(());
        }
        self.delete_breaker
            .call(|| self.inner.delete(public_id))
            .await?;
        info!(public_id, "asset deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ASSET_CLEANUP, DEFAULT_LEASE, EnqueueOptions, InMemoryJobStore, JobStore};

    struct Fixture {
        storage: Arc<InMemoryAssetStorage>,
        jobs: Arc<InMemoryJobStore>,
        guarded: GuardedAssetStorage,
        registry: BreakerRegistry,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryAssetStorage::new("https://assets.test"));
        let jobs = Arc::new(InMemoryJobStore::new());
        let queue = JobQueue::new("product-tasks", jobs.clone(), EnqueueOptions::default());
        let registry = BreakerRegistry::new();
        let guarded = GuardedAssetStorage::new(
            storage.clone(),
            &registry,
            BreakerConfig::asset_upload(),
            BreakerConfig::asset_delete(),
            queue,
        );
        Fixture {
            storage,
            jobs,
            guarded,
            registry,
        }
    }

    fn file() -> AssetUpload {
        AssetUpload::new("support-tickets/attachments", "a.png", vec![1, 2, 3])
    }

    #[tokio::test]
    async fn healthy_upload_is_genuine() {
        let f = fixture();
        let outcome = f.guarded.upload(&file()).await.unwrap();
        assert!(!outcome.is_degraded());
        let asset = outcome.into_inner();
        assert!(asset.public_id.starts_with("support-tickets/attachments/"));
        assert!(!asset.fallback);
        assert!(f.storage.contains(&asset.public_id));
    }

    #[tokio::test]
    async fn unavailable_store_yields_placeholder() {
        let f = fixture();
        f.storage.set_available(false);
        let outcome = f.guarded.upload(&file()).await.unwrap();
        assert!(outcome.is_degraded());
        let asset = outcome.into_inner();
        assert!(asset.fallback);
        assert!(asset.public_id.starts_with(FALLBACK_PREFIX));
        assert!(asset.url.starts_with("/uploads/fallback-"));
        assert_eq!(f.registry.health()["asset-upload"].fallback_executions, 1);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_before_the_breaker() {
        let f = fixture();
        let err = f
            .guarded
            .upload(&AssetUpload::new("x", "empty", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(f.registry.health()["asset-upload"].stats.fires, 0);
    }

    #[tokio::test]
    async fn failed_delete_is_queued_as_cleanup_job() {
        let f = fixture();
        let asset = f.guarded.upload(&file()).await.unwrap().into_inner();

        f.storage.set_available(false);
        let status = f.guarded.delete(&asset.public_id).await.unwrap();
        assert_eq!(status, DeleteStatus::Queued);

        let stats = f.jobs.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        let job = f.jobs.claim_next(Utc::now(), DEFAULT_LEASE).await.unwrap().unwrap();
        assert_eq!(job.job_type(), ASSET_CLEANUP);
        assert_eq!(job.envelope.data["publicId"], asset.public_id.as_str());

        f.storage.set_available(true);
        f.guarded.delete_now(&asset.public_id).await.unwrap();
        assert!(!f.storage.contains(&asset.public_id));
    }

    #[tokio::test]
    async fn delete_now_surfaces_failure_for_retry() {
        let f = fixture();
        f.storage.set_available(false);
        let err = f.guarded.delete_now("products/x").await.unwrap_err();
        assert!(matches!(err, AppError::ExternalService { fallback_used: false, .. }));
    }

    #[tokio::test]
    async fn placeholder_assets_need_no_remote_delete() {
        let f = fixture();
        f.storage.set_available(false);
        assert_eq!(
            f.guarded.delete("fallback-1700000000000").await.unwrap(),
            DeleteStatus::Deleted
        );
        assert!(f.jobs.is_empty());
    }
}
