//! Document store boundary.
//!
//! Resources are stored as JSON documents grouped into collections. The store offers the
//! three capabilities the data-access layer relies on:
//!
//! - point reads and single-document writes
//! - keyset range queries (`find_range`) sorted by a primary field plus the document id
//! - multi-document atomic sessions (`start_session` → writes → `commit` / `abort`)
//!
//! Every write method takes an optional session. Without one, the write is applied and
//! visible immediately; with one, it is only visible inside that session until commit.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use backoffice_core::AppError;

use crate::pagination::RangeQuery;

pub use in_memory::{InMemoryDocumentStore, InMemorySession};
pub use postgres::{PostgresDocumentStore, PostgresSession};

/// A stored document. `body` is always a JSON object and carries `id` as well.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: JsonValue,
}

impl Document {
    pub fn new(id: impl Into<String>, body: JsonValue) -> Result<Self, StoreError> {
        if !body.is_object() {
            return Err(StoreError::InvalidDocument(
                "document body must be a JSON object".to_string(),
            ));
        }
        Ok(Self {
            id: id.into(),
            body,
        })
    }

    /// Top-level field lookup.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.body.get(name)
    }

    /// Apply a shallow merge patch (top-level keys replace existing ones). `id` is immutable.
    pub fn merge(&mut self, patch: &JsonMap<String, JsonValue>) {
        if let Some(obj) = self.body.as_object_mut() {
            for (k, v) in patch {
                if k == "id" {
                    continue;
                }
                obj.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Equality filter over top-level document fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: JsonMap<String, JsonValue>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.fields
            .iter()
            .all(|(k, v)| doc.field(k).is_some_and(|actual| actual == v))
    }

    /// The filter as a JSON object (Postgres `@>` containment operand).
    pub fn as_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

/// Document store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("backend error in {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(key) => AppError::Conflict(format!("duplicate key: {key}")),
            StoreError::WriteConflict(msg) => AppError::Conflict(msg),
            StoreError::InvalidDocument(msg) => AppError::Validation(msg),
            backend @ StoreError::Backend { .. } => AppError::Storage(backend.to_string()),
        }
    }
}

/// An atomic multi-document session.
///
/// Consumed by `commit`/`abort`; dropping an unfinished session discards its writes.
#[async_trait]
pub trait StoreSession: Send + 'static {
    fn id(&self) -> Uuid;

    async fn commit(self) -> Result<(), StoreError>;

    async fn abort(self) -> Result<(), StoreError>;
}

/// Collection-oriented document store with range queries and atomic sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    type Session: StoreSession;

    async fn start_session(&self) -> Result<Self::Session, StoreError>;

    /// Insert a new document. Fails with `Duplicate` if the id or a unique field is taken.
    async fn insert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        doc: Document,
    ) -> Result<(), StoreError>;

    async fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn find_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    /// Merge `patch` into the document and return the updated version, `None` if absent.
    async fn update(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
        patch: &JsonMap<String, JsonValue>,
    ) -> Result<Option<Document>, StoreError>;

    /// Delete and return the removed document, `None` if absent.
    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Committed documents matching the query, sorted by `(sort field, id)` in the query's
    /// direction, at most `query.limit` of them.
    async fn find_range(
        &self,
        collection: &str,
        query: &RangeQuery,
    ) -> Result<Vec<Document>, StoreError>;
}

/// Behavior every `DocumentStore` backend must share.
#[cfg(test)]
pub(crate) mod conformance {
    use serde_json::{Value as JsonValue, json};

    use super::{Document, DocumentStore, Filter};
    use crate::pagination::{RangeQuery, SortKind, SortSpec};

    async fn ids_in_order<S: DocumentStore>(store: &S, collection: &str, sort: SortSpec) -> Vec<String> {
        let query = RangeQuery {
            filter: Filter::new(),
            sort,
            after: None,
            limit: 10,
        };
        store
            .find_range(collection, &query)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect()
    }

    async fn seed<S: DocumentStore>(store: &S, collection: &str, rows: Vec<(&str, JsonValue)>) {
        for (id, body) in rows {
            store
                .insert(None, collection, Document::new(id, body).unwrap())
                .await
                .unwrap();
        }
    }

    /// Range reads skip documents whose sort value has the wrong kind instead of failing.
    pub(crate) async fn mistyped_sort_values_are_skipped<S: DocumentStore>(store: &S, prefix: &str) {
        let counters = format!("{prefix}_counters");
        seed(
            store,
            &counters,
            vec![
                ("a", json!({"id": "a", "n": 1})),
                ("b", json!({"id": "b", "n": 1.5})),
                ("c", json!({"id": "c", "n": 2})),
                ("d", json!({"id": "d", "n": "3"})),
                ("e", json!({"id": "e"})),
            ],
        )
        .await;
        assert_eq!(
            ids_in_order(store, &counters, SortSpec::ascending("n", SortKind::Integer)).await,
            vec!["a", "c"]
        );
        assert_eq!(
            ids_in_order(store, &counters, SortSpec::ascending("n", SortKind::Float)).await,
            vec!["a", "b", "c"]
        );

        let events = format!("{prefix}_events");
        seed(
            store,
            &events,
            vec![
                ("x", json!({"id": "x", "createdAt": "2024-05-01T10:00:00.123Z"})),
                ("y", json!({"id": "y", "createdAt": "yesterday"})),
                ("z", json!({"id": "z", "createdAt": "2024-13-45T00:00:00Z"})),
                ("w", json!({"id": "w", "createdAt": 1714557600000_i64})),
            ],
        )
        .await;
        assert_eq!(
            ids_in_order(store, &events, SortSpec::newest_first()).await,
            vec!["x"]
        );
        assert_eq!(
            ids_in_order(store, &events, SortSpec::ascending("createdAt", SortKind::Text)).await,
            vec!["x", "z", "y"]
        );
    }
}
