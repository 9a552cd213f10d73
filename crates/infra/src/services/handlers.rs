use async_trait::async_trait;
use tracing::info;

use backoffice_core::AppResult;

use super::ProductService;
use crate::assets::GuardedAssetStorage;
use crate::jobs::{AssetCleanupJob, BulkImportJob, ImageOptimizationJob, JobHandlers};
use crate::store::DocumentStore;

/// Handler table of the `product-tasks` queue.
pub struct CatalogJobHandlers<S: DocumentStore> {
    products: ProductService<S>,
    assets: GuardedAssetStorage,
}

impl<S: DocumentStore> CatalogJobHandlers<S> {
    pub fn new(products: ProductService<S>, assets: GuardedAssetStorage) -> Self {
        Self { products, assets }
    }
}

#[async_trait]
impl<S: DocumentStore> JobHandlers for CatalogJobHandlers<S> {
    async fn bulk_import(&self, job: BulkImportJob) -> AppResult<()> {
        let imported = self.products.execute_bulk_import(job.products).await?;
        info!(imported = imported.len(), "bulk import job finished");
        Ok(())
    }

    async fn image_optimization(&self, job: ImageOptimizationJob) -> AppResult<()> {
        self.products.mark_images_optimized(job.product_id).await?;
        Ok(())
    }

    async fn asset_cleanup(&self, job: AssetCleanupJob) -> AppResult<()> {
        self.assets.delete_now(&job.public_id).await
    }
}
