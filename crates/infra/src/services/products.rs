use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use backoffice_core::{AppError, AppResult, RecordId};

use super::{PRODUCTS, invalidate};
use crate::cache::{Audience, CacheStore, response_key};
use crate::jobs::{BulkImportJob, ImageOptimizationJob, JobId, JobPayload, JobQueue};
use crate::model::{Product, ProductDraft};
use crate::pagination::{Page, PageRequest, SortKind, SortSpec};
use crate::repository::{Repository, patch};
use crate::store::{DocumentStore, Filter};
use crate::transaction::TransactionCoordinator;

/// Largest batch accepted by a single bulk import.
pub const MAX_BULK_IMPORT: usize = 5_000;

/// Product catalog: cached listings, single and bulk creation, image follow-up work.
pub struct ProductService<S: DocumentStore> {
    products: Repository<S, Product>,
    tx: TransactionCoordinator<S>,
    cache: CacheStore,
    queue: JobQueue,
}

impl<S: DocumentStore> Clone for ProductService<S> {
    fn clone(&self) -> Self {
        Self {
            products: self.products.clone(),
            tx: self.tx.clone(),
            cache: self.cache.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<S: DocumentStore> ProductService<S> {
    pub fn new(store: Arc<S>, cache: CacheStore, queue: JobQueue) -> Self {
        Self {
            products: Repository::new(store.clone()),
            tx: TransactionCoordinator::new(store),
            cache,
            queue,
        }
    }

    /// Newest products first (cache-aside, public audience).
    pub async fn list(&self, request: &PageRequest) -> AppResult<Page<Product>> {
        self.cached_page("newest", SortSpec::newest_first(), request)
            .await
    }

    /// Products by descending relevance score.
    ///
    /// Scores are floats; cursors carry them in their shortest round-trip form, so pages stay
    /// consistent as long as the stored scores do not change between requests.
    pub async fn list_by_relevance(&self, request: &PageRequest) -> AppResult<Page<Product>> {
        self.cached_page(
            "relevance",
            SortSpec::descending("score", SortKind::Float),
            request,
        )
        .await
    }

    async fn cached_page(
        &self,
        ordering: &str,
        sort: SortSpec,
        request: &PageRequest,
    ) -> AppResult<Page<Product>> {
        let segment = format!("{ordering}:{}", request.cache_segment());
        let key = response_key(Audience::Public, PRODUCTS, &segment);
        let filter = Filter::new();
        self.cache
            .get_or_load(&key, None, || self.products.find_page(&filter, &sort, request))
            .await
    }

    pub async fn get(&self, id: RecordId) -> AppResult<Product> {
        self.products
            .find_by_id(None, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("product {id}")))
    }

    /// Create one product. A taken SKU is a `Conflict`.
    #[instrument(skip(self, draft), fields(sku = %draft.sku), err)]
    pub async fn create(&self, draft: ProductDraft) -> AppResult<Product> {
        validate_draft(&draft)?;
        let product = draft.into_product();
        self.products.create(None, &product).await?;
        self.invalidate_listings().await;
        Ok(product)
    }

    /// Hand a bulk import to the worker pool. Returns the queued job id.
    #[instrument(skip(self, drafts), fields(count = drafts.len()), err)]
    pub async fn enqueue_bulk_import(&self, drafts: Vec<ProductDraft>) -> AppResult<JobId> {
        validate_batch(&drafts)?;
        self.queue
            .enqueue(JobPayload::BulkImport(BulkImportJob { products: drafts }))
            .await
    }

    /// Insert every product of the batch in one transaction. Any failure, including a
    /// duplicate SKU, aborts the whole batch.
    #[instrument(skip(self, drafts), fields(count = drafts.len()), err)]
    pub async fn execute_bulk_import(&self, drafts: Vec<ProductDraft>) -> AppResult<Vec<Product>> {
        validate_batch(&drafts)?;
        let products: Vec<Product> = drafts.into_iter().map(ProductDraft::into_product).collect();

        let repo = self.products.clone();
        let staged = products.clone();
        self.tx
            .execute(move |uow| {
                Box::pin(async move {
                    for product in &staged {
                        repo.create(Some(&mut *uow), product).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        self.invalidate_listings().await;
        info!(imported = products.len(), "bulk import committed");
        Ok(products)
    }

    /// Queue image optimization for a product.
    pub async fn enqueue_image_optimization(&self, product_id: RecordId) -> AppResult<JobId> {
        self.queue
            .enqueue(JobPayload::ImageOptimization(ImageOptimizationJob { product_id }))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn mark_images_optimized(&self, product_id: RecordId) -> AppResult<Product> {
        let product = self
            .products
            .update(
                None,
                product_id,
                patch([("imagesOptimized", JsonValue::Bool(true))]),
            )
            .await?
            .ok_or_else(|| AppError::not_found(format!("product {product_id}")))?;
        self.invalidate_listings().await;
        Ok(product)
    }

    async fn invalidate_listings(&self) {
        invalidate(&self.cache, PRODUCTS, &[Audience::Public, Audience::Admin]).await;
    }
}

fn validate_draft(draft: &ProductDraft) -> AppResult<()> {
    if draft.sku.trim().is_empty() || draft.name.trim().is_empty() {
        return Err(AppError::validation("product sku and name are required"));
    }
    if draft.price_cents < 0 {
        return Err(AppError::validation(format!(
            "product {} has a negative price",
            draft.sku
        )));
    }
    if !draft.score.is_finite() {
        return Err(AppError::validation(format!(
            "product {} has a non-finite score",
            draft.sku
        )));
    }
    Ok(())
}

fn validate_batch(drafts: &[ProductDraft]) -> AppResult<()> {
    if drafts.is_empty() {
        return Err(AppError::validation("bulk import needs at least one product"));
    }
    if drafts.len() > MAX_BULK_IMPORT {
        return Err(AppError::validation(format!(
            "bulk import is limited to {MAX_BULK_IMPORT} products, got {}",
            drafts.len()
        )));
    }
    drafts.iter().try_for_each(validate_draft)
}
