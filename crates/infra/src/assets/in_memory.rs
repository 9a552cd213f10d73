use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{AssetError, AssetStorage, AssetUpload, StoredAsset};

/// Asset store kept in process memory, for dev and tests.
///
/// `set_available(false)` makes every call fail as if the remote service were down.
#[derive(Debug)]
pub struct InMemoryAssetStorage {
    base_url: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    available: AtomicBool,
}

impl InMemoryAssetStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains(&self, public_id: &str) -> bool {
        self.objects.read().contains_key(public_id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), AssetError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AssetError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl AssetStorage for InMemoryAssetStorage {
    async fn upload(&self, upload: &AssetUpload) -> Result<StoredAsset, AssetError> {
        self.ensure_available()?;
        let folder = upload.folder.trim_matches('/');
        let public_id = format!("{folder}/{}", Uuid::now_v7().simple());
        self.objects
            .write()
            .insert(public_id.clone(), upload.bytes.clone());
        Ok(StoredAsset {
            url: format!("{}/{public_id}", self.base_url),
            public_id,
            fallback: false,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), AssetError> {
        self.ensure_available()?;
        match self.objects.write().remove(public_id) {
            Some(_) => Ok(()),
            None => Err(AssetError::Rejected(format!("no asset '{public_id}'"))),
        }
    }
}
