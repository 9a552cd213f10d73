//! Process wiring: document store, job store, cache, breakers, queue and the worker pool.
//!
//! With `database.url` set everything persistent lives in Postgres; without it the process
//! runs entirely in memory (dev). The cache uses Redis when `cache.redis_url` is set and
//! reachable, and falls back to process memory otherwise.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use backoffice_infra::assets::{GuardedAssetStorage, InMemoryAssetStorage};
use backoffice_infra::cache::{CacheBackend, CacheStore, InMemoryCacheBackend};
use backoffice_infra::config::{CacheSettings, Settings};
use backoffice_infra::jobs::{
    InMemoryJobStore, JobQueue, JobStore, PostgresJobStore, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};
use backoffice_infra::migrations;
use backoffice_infra::resilience::BreakerRegistry;
use backoffice_infra::services::{CatalogJobHandlers, ProductService};
use backoffice_infra::store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore};

/// Shared state handed to the HTTP handlers.
pub struct AppServices {
    pub breakers: Arc<BreakerRegistry>,
    pub queue: JobQueue,
    pub cache: CacheStore,
    pub store_backend: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Everything `main` has to keep alive and shut down.
pub struct Runtime {
    pub services: Arc<AppServices>,
    pub workers: WorkerPoolHandle,
}

pub async fn build(settings: &Settings) -> anyhow::Result<Runtime> {
    let cache = build_cache(&settings.cache).await;

    match settings.database.url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .min_connections(settings.database.min_connections)
                .max_connections(settings.database.max_connections)
                .acquire_timeout(settings.database.acquire_timeout())
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;

            if settings.database.run_migrations {
                let applied = migrations::run(&pool)
                    .await
                    .context("failed to apply migrations")?;
                info!(applied = applied.len(), "database schema up to date");
            }

            let store = Arc::new(PostgresDocumentStore::new(pool.clone()));
            let jobs: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool));
            Ok(wire(settings, "postgres", store, jobs, cache))
        }
        None => {
            warn!("no database url configured; using in-memory stores");
            let store = Arc::new(
                InMemoryDocumentStore::new()
                    .with_unique_index("users", "email")
                    .with_unique_index("products", "sku"),
            );
            let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
            Ok(wire(settings, "in-memory", store, jobs, cache))
        }
    }
}

fn wire<S: DocumentStore>(
    settings: &Settings,
    store_backend: &'static str,
    store: Arc<S>,
    jobs: Arc<dyn JobStore>,
    cache: CacheStore,
) -> Runtime {
    let breakers = Arc::new(BreakerRegistry::new());
    let queue = JobQueue::new(
        &settings.jobs.queue_name,
        jobs.clone(),
        settings.jobs.enqueue_defaults(),
    );
    let assets = GuardedAssetStorage::new(
        Arc::new(InMemoryAssetStorage::new(&settings.assets.base_url)),
        &breakers,
        settings.breakers.asset_upload.clone(),
        settings.breakers.asset_delete.clone(),
        queue.clone(),
    );

    let products = ProductService::new(store, cache.clone(), queue.clone());
    let handlers = Arc::new(CatalogJobHandlers::new(products, assets));
    let mut pool_config = WorkerPoolConfig::default()
        .with_name(&settings.jobs.queue_name)
        .with_concurrency(settings.jobs.concurrency);
    pool_config.poll_interval = settings.jobs.poll_interval();
    pool_config.job_timeout = settings.jobs.job_timeout();
    pool_config.lease = settings.jobs.lease();
    let workers = WorkerPool::new(jobs, handlers, pool_config).spawn();

    info!(
        store = store_backend,
        cache = cache.provider_name(),
        queue = %settings.jobs.queue_name,
        concurrency = settings.jobs.concurrency,
        "services wired"
    );

    Runtime {
        services: Arc::new(AppServices {
            breakers,
            queue,
            cache,
            store_backend,
            started_at: Utc::now(),
        }),
        workers,
    }
}

async fn build_cache(settings: &CacheSettings) -> CacheStore {
    let backend: Arc<dyn CacheBackend> = match settings.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => match backoffice_infra::cache::RedisCacheBackend::connect(url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                warn!(error = %e, "redis unavailable; caching in process memory");
                Arc::new(InMemoryCacheBackend::new())
            }
        },
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("redis support not compiled in; caching in process memory");
            Arc::new(InMemoryCacheBackend::new())
        }
        None => Arc::new(InMemoryCacheBackend::new()),
    };
    CacheStore::new(backend)
        .with_default_ttl(settings.default_ttl())
        .with_operation_timeout(settings.operation_timeout())
}
