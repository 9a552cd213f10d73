//! The closed set of background job types and their handler table.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use backoffice_core::{AppError, AppResult, RecordId};

use super::types::JobEnvelope;
use crate::model::ProductDraft;

pub const BULK_IMPORT: &str = "BULK_IMPORT";
pub const IMAGE_OPTIMIZATION: &str = "IMAGE_OPTIMIZATION";
pub const ASSET_CLEANUP: &str = "ASSET_CLEANUP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportJob {
    pub products: Vec<ProductDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOptimizationJob {
    pub product_id: RecordId,
}

/// Retry of an asset delete that the storage breaker could not perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCleanupJob {
    pub public_id: String,
}

/// Decoded job payload.
///
/// Tags this build does not know are kept as `Unknown` so they can be acknowledged instead
/// of failing and being retried forever.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    BulkImport(BulkImportJob),
    ImageOptimization(ImageOptimizationJob),
    AssetCleanup(AssetCleanupJob),
    Unknown {
        tag: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("malformed {tag} payload: {message}")]
    MalformedPayload { tag: String, message: String },

    #[error("failed to encode {tag} payload: {message}")]
    Encode { tag: String, message: String },

    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Encode { .. } => AppError::Validation(err.to_string()),
            other => AppError::JobProcessing(other.to_string()),
        }
    }
}

fn decode<T: DeserializeOwned>(envelope: &JobEnvelope) -> Result<T, JobError> {
    serde_json::from_value(envelope.data.clone()).map_err(|e| JobError::MalformedPayload {
        tag: envelope.job_type.clone(),
        message: e.to_string(),
    })
}

fn encode<T: Serialize>(tag: &str, data: &T) -> Result<JobEnvelope, JobError> {
    let data = serde_json::to_value(data).map_err(|e| JobError::Encode {
        tag: tag.to_string(),
        message: e.to_string(),
    })?;
    Ok(JobEnvelope {
        job_type: tag.to_string(),
        data,
    })
}

impl JobPayload {
    pub fn tag(&self) -> &str {
        match self {
            JobPayload::BulkImport(_) => BULK_IMPORT,
            JobPayload::ImageOptimization(_) => IMAGE_OPTIMIZATION,
            JobPayload::AssetCleanup(_) => ASSET_CLEANUP,
            JobPayload::Unknown { tag, .. } => tag,
        }
    }

    pub fn from_envelope(envelope: &JobEnvelope) -> Result<Self, JobError> {
        Ok(match envelope.job_type.as_str() {
            BULK_IMPORT => JobPayload::BulkImport(decode(envelope)?),
            IMAGE_OPTIMIZATION => JobPayload::ImageOptimization(decode(envelope)?),
            ASSET_CLEANUP => JobPayload::AssetCleanup(decode(envelope)?),
            other => JobPayload::Unknown {
                tag: other.to_string(),
                data: envelope.data.clone(),
            },
        })
    }

    pub fn to_envelope(&self) -> Result<JobEnvelope, JobError> {
        match self {
            JobPayload::BulkImport(job) => encode(BULK_IMPORT, job),
            JobPayload::ImageOptimization(job) => encode(IMAGE_OPTIMIZATION, job),
            JobPayload::AssetCleanup(job) => encode(ASSET_CLEANUP, job),
            JobPayload::Unknown { tag, data } => Ok(JobEnvelope {
                job_type: tag.clone(),
                data: data.clone(),
            }),
        }
    }
}

/// One handler per job type. Adding a job type means adding a method here, so every
/// worker implementation is forced to handle it.
#[async_trait]
pub trait JobHandlers: Send + Sync + 'static {
    async fn bulk_import(&self, job: BulkImportJob) -> AppResult<()>;

    async fn image_optimization(&self, job: ImageOptimizationJob) -> AppResult<()>;

    async fn asset_cleanup(&self, job: AssetCleanupJob) -> AppResult<()>;
}

/// Route a decoded payload to its handler. Unknown tags are logged and acknowledged.
pub async fn dispatch<H: JobHandlers + ?Sized>(handlers: &H, payload: JobPayload) -> AppResult<()> {
    match payload {
        JobPayload::BulkImport(job) => handlers.bulk_import(job).await,
        JobPayload::ImageOptimization(job) => handlers.image_optimization(job).await,
        JobPayload::AssetCleanup(job) => handlers.asset_cleanup(job).await,
        JobPayload::Unknown { tag, .. } => {
            warn!(job_type = %tag, "unknown job type; acknowledging without work");
            Ok(())
        }
    }
}
