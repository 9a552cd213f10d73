//! Cache-aside layer.
//!
//! [`CacheStore`] wraps a [`CacheBackend`] and never lets a cache problem reach the caller:
//! failed or slow reads degrade to a miss, failed writes and invalidations degrade to a
//! no-op. Every backend call is bounded by a per-operation timeout so a hung cache cannot
//! stall a request.

pub mod in_memory;
pub mod keys;
#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use backoffice_core::AppResult;

pub use in_memory::InMemoryCacheBackend;
pub use keys::{Audience, family_pattern, glob_match, response_key};
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheBackend;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default bound on a single backend call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),

    #[error("cache operation '{0}' timed out")]
    Timeout(&'static str),

    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Raw string key-value cache with TTL and glob deletion.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key matching the glob `pattern`; returns how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64>;

    async fn flush(&self) -> CacheResult<()>;

    fn provider_name(&self) -> &'static str;
}

/// Typed, failure-tolerant cache handle shared by services.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    op_timeout: Duration,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("provider", &self.backend.provider_name())
            .field("default_ttl", &self.default_ttl)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            default_ttl: DEFAULT_TTL,
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend.provider_name()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .unwrap_or(Err(CacheError::Timeout(operation)))
    }

    /// Cached value for `key`, or `None` on miss, decode failure or cache failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.bounded("get", self.backend.get(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "cached value could not be decoded; treating as miss");
                None
            }
        }
    }

    /// Store `value` under `key`; `ttl` defaults to the store's default lifetime.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "value could not be encoded for caching");
                return;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.bounded("set", self.backend.set(key, &raw, ttl)).await {
            warn!(key, error = %e, "cache write failed; skipping");
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.bounded("delete", self.backend.delete(key)).await {
            warn!(key, error = %e, "cache delete failed; skipping");
        }
    }

    /// Invalidate every key matching `pattern`. Returns the number removed (0 on failure).
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self
            .bounded("delete_pattern", self.backend.delete_pattern(pattern))
            .await
        {
            Ok(n) => {
                debug!(pattern, deleted = n, "cache invalidated");
                n
            }
            Err(e) => {
                warn!(pattern, error = %e, "cache invalidation failed; skipping");
                0
            }
        }
    }

    pub async fn flush(&self) {
        if let Err(e) = self.bounded("flush", self.backend.flush()).await {
            warn!(error = %e, "cache flush failed; skipping");
        }
    }

    /// Cache-aside read: return the cached value, or run `load`, cache its result and
    /// return it. Loader errors are returned as-is and nothing is cached.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, load: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = load().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
