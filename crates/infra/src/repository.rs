//! Typed repository over one document collection.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::instrument;

use backoffice_core::{AppError, AppResult, RecordId};

use crate::pagination::{Page, PageRequest, SortSpec, paginate};
use crate::store::{Document, DocumentStore, Filter};
use crate::transaction::UnitOfWork;

/// A resource stored as one document per record.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> RecordId;
}

/// Current time truncated to milliseconds, the precision cursors and Postgres keep.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn to_document<T: Record>(record: &T) -> AppResult<Document> {
    let body = serde_json::to_value(record)
        .map_err(|e| AppError::Storage(format!("failed to encode {}: {e}", T::COLLECTION)))?;
    Ok(Document::new(record.id().to_string(), body)?)
}

fn from_document<T: Record>(doc: Document) -> AppResult<T> {
    serde_json::from_value(doc.body).map_err(|e| {
        AppError::Storage(format!(
            "failed to decode {} document {}: {e}",
            T::COLLECTION,
            doc.id
        ))
    })
}

/// CRUD and keyset listing for records of type `T`.
///
/// Every write accepts an optional unit of work; without one the write is applied directly.
pub struct Repository<S: DocumentStore, T: Record> {
    store: Arc<S>,
    _record: PhantomData<fn() -> T>,
}

impl<S: DocumentStore, T: Record> Clone for Repository<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}

impl<S: DocumentStore, T: Record> Repository<S, T> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    #[instrument(skip(self, uow, record), fields(collection = T::COLLECTION, id = %record.id()), err)]
    pub async fn create(&self, uow: Option<&mut UnitOfWork<S::Session>>, record: &T) -> AppResult<()> {
        let doc = to_document(record)?;
        self.store
            .insert(uow.map(UnitOfWork::session_mut), T::COLLECTION, doc)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(
        &self,
        uow: Option<&mut UnitOfWork<S::Session>>,
        id: RecordId,
    ) -> AppResult<Option<T>> {
        self.store
            .get(uow.map(UnitOfWork::session_mut), T::COLLECTION, &id.to_string())
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn find_one(
        &self,
        uow: Option<&mut UnitOfWork<S::Session>>,
        filter: &Filter,
    ) -> AppResult<Option<T>> {
        self.store
            .find_one(uow.map(UnitOfWork::session_mut), T::COLLECTION, filter)
            .await?
            .map(from_document)
            .transpose()
    }

    /// Shallow-merge `patch` into the record. `None` when the record does not exist.
    ///
    /// The patched document must still decode as `T`; a patch that breaks the shape is
    /// rejected as a validation error before anything is written.
    #[instrument(skip(self, uow, patch), fields(collection = T::COLLECTION, id = %id), err)]
    pub async fn update(
        &self,
        mut uow: Option<&mut UnitOfWork<S::Session>>,
        id: RecordId,
        patch: JsonValue,
    ) -> AppResult<Option<T>> {
        let JsonValue::Object(patch) = patch else {
            return Err(AppError::validation("update patch must be a JSON object"));
        };

        let key = id.to_string();
        let Some(mut current) = self
            .store
            .get(uow.as_deref_mut().map(UnitOfWork::session_mut), T::COLLECTION, &key)
            .await?
        else {
            return Ok(None);
        };
        current.merge(&patch);
        serde_json::from_value::<T>(current.body)
            .map_err(|e| AppError::validation(format!("patch rejected: {e}")))?;

        self.store
            .update(uow.map(UnitOfWork::session_mut), T::COLLECTION, &key, &patch)
            .await?
            .map(from_document)
            .transpose()
    }

    #[instrument(skip(self, uow), fields(collection = T::COLLECTION, id = %id), err)]
    pub async fn delete(
        &self,
        uow: Option<&mut UnitOfWork<S::Session>>,
        id: RecordId,
    ) -> AppResult<Option<T>> {
        self.store
            .delete(uow.map(UnitOfWork::session_mut), T::COLLECTION, &id.to_string())
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn count(&self, filter: &Filter) -> AppResult<u64> {
        Ok(self.store.count(T::COLLECTION, filter).await?)
    }

    /// One keyset page of committed records.
    pub async fn find_page(
        &self,
        filter: &Filter,
        sort: &SortSpec,
        request: &PageRequest,
    ) -> AppResult<Page<T>> {
        paginate(&*self.store, T::COLLECTION, filter, sort, request)
            .await?
            .try_map(from_document)
    }
}

/// Builds a shallow patch object from `(field, value)` pairs.
pub fn patch<I, K>(fields: I) -> JsonValue
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    JsonValue::Object(
        fields
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<JsonMap<String, JsonValue>>(),
    )
}
