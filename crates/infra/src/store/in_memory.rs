use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use super::{Document, DocumentStore, Filter, StoreError, StoreSession};
use crate::pagination::RangeQuery;

type Collection = BTreeMap<String, Document>;
type Collections = HashMap<String, Collection>;

/// In-memory document store.
///
/// Intended for tests/dev. Sessions buffer their writes and apply them all-or-nothing under
/// a single write lock on commit; reads inside a session see the session's own writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    data: Arc<RwLock<Collections>>,
    unique: Arc<HashMap<String, Vec<String>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `field` unique within `collection` (null/missing values are exempt).
    pub fn with_unique_index(mut self, collection: &str, field: &str) -> Self {
        Arc::make_mut(&mut self.unique)
            .entry(collection.to_string())
            .or_default()
            .push(field.to_string());
        self
    }

    fn unique_fields(&self, collection: &str) -> &[String] {
        self.unique.get(collection).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A buffered write, replayed in order on commit.
#[derive(Debug, Clone)]
enum Staged {
    Insert { collection: String, doc: Document },
    Replace { collection: String, doc: Document },
    Remove { collection: String, id: String },
}

impl Staged {
    fn key(&self) -> (&str, &str) {
        match self {
            Staged::Insert { collection, doc } | Staged::Replace { collection, doc } => {
                (collection.as_str(), doc.id.as_str())
            }
            Staged::Remove { collection, id } => (collection.as_str(), id.as_str()),
        }
    }
}

/// Session over an [`InMemoryDocumentStore`].
#[derive(Debug)]
pub struct InMemorySession {
    id: Uuid,
    store: InMemoryDocumentStore,
    staged: Vec<Staged>,
    finished: bool,
}

impl InMemorySession {
    /// Latest version of a document as seen from inside this session.
    fn view(&self, committed: &Collections, collection: &str, id: &str) -> Option<Document> {
        for op in self.staged.iter().rev() {
            if op.key() == (collection, id) {
                return match op {
                    Staged::Insert { doc, .. } | Staged::Replace { doc, .. } => Some(doc.clone()),
                    Staged::Remove { .. } => None,
                };
            }
        }
        committed.get(collection).and_then(|c| c.get(id)).cloned()
    }

    /// Every document in `collection` as seen from inside this session.
    fn view_all(&self, committed: &Collections, collection: &str) -> Collection {
        let mut merged = committed.get(collection).cloned().unwrap_or_default();
        for op in &self.staged {
            apply(&mut merged, collection, op);
        }
        merged
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            debug!(
                session_id = %self.id,
                discarded = self.staged.len(),
                "session dropped without commit; staged writes discarded"
            );
        }
    }
}

fn apply(target: &mut Collection, collection: &str, op: &Staged) {
    if op.key().0 != collection {
        return;
    }
    match op {
        Staged::Insert { doc, .. } | Staged::Replace { doc, .. } => {
            target.insert(doc.id.clone(), doc.clone());
        }
        Staged::Remove { id, .. } => {
            target.remove(id);
        }
    }
}

/// Name of the first unique field on which `doc` collides with another document.
fn unique_violation(collection: &Collection, fields: &[String], doc: &Document) -> Option<String> {
    fields
        .iter()
        .find(|field| {
            let Some(value) = doc.field(field).filter(|v| !v.is_null()) else {
                return false;
            };
            collection
                .values()
                .any(|other| other.id != doc.id && other.field(field) == Some(value))
        })
        .cloned()
}

fn check_insert(
    collection_name: &str,
    collection: &Collection,
    fields: &[String],
    doc: &Document,
) -> Result<(), StoreError> {
    if collection.contains_key(&doc.id) {
        return Err(StoreError::Duplicate(format!("{collection_name}.id={}", doc.id)));
    }
    if let Some(field) = unique_violation(collection, fields, doc) {
        return Err(StoreError::Duplicate(format!("{collection_name}.{field}")));
    }
    Ok(())
}

#[async_trait]
impl StoreSession for InMemorySession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }

        let mut data = self.store.data.write();

        // Validate and apply against copies of the touched collections, then swap them in.
        let mut working: HashMap<String, Collection> = HashMap::new();
        for op in &staged {
            let name = op.key().0;
            let coll = working
                .entry(name.to_string())
                .or_insert_with(|| data.get(name).cloned().unwrap_or_default());
            match op {
                Staged::Insert { doc, .. } => {
                    check_insert(name, coll, self.store.unique_fields(name), doc)?;
                }
                Staged::Replace { doc, .. } => {
                    if !coll.contains_key(&doc.id) {
                        return Err(StoreError::WriteConflict(format!(
                            "{name}/{} was removed concurrently",
                            doc.id
                        )));
                    }
                    if let Some(field) = unique_violation(coll, self.store.unique_fields(name), doc)
                    {
                        return Err(StoreError::Duplicate(format!("{name}.{field}")));
                    }
                }
                Staged::Remove { .. } => {}
            }
            apply(coll, name, op);
        }

        let writes = staged.len();
        for (name, coll) in working {
            data.insert(name, coll);
        }
        debug!(session_id = %self.id, writes, "session committed");
        Ok(())
    }

    async fn abort(mut self) -> Result<(), StoreError> {
        self.finished = true;
        debug!(session_id = %self.id, discarded = self.staged.len(), "session aborted");
        self.staged.clear();
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    type Session = InMemorySession;

    async fn start_session(&self) -> Result<Self::Session, StoreError> {
        Ok(InMemorySession {
            id: Uuid::now_v7(),
            store: self.clone(),
            staged: Vec::new(),
            finished: false,
        })
    }

    async fn insert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        doc: Document,
    ) -> Result<(), StoreError> {
        let fields = self.unique_fields(collection);
        match session {
            Some(session) => {
                let view = session.view_all(&self.data.read(), collection);
                check_insert(collection, &view, fields, &doc)?;
                session.staged.push(Staged::Insert {
                    collection: collection.to_string(),
                    doc,
                });
            }
            None => {
                let mut data = self.data.write();
                let coll = data.entry(collection.to_string()).or_default();
                check_insert(collection, coll, fields, &doc)?;
                coll.insert(doc.id.clone(), doc);
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let data = self.data.read();
        Ok(match session {
            Some(session) => session.view(&data, collection, id),
            None => data.get(collection).and_then(|c| c.get(id)).cloned(),
        })
    }

    async fn find_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let data = self.data.read();
        Ok(match session {
            Some(session) => session
                .view_all(&data, collection)
                .into_values()
                .find(|d| filter.matches(d)),
            None => data
                .get(collection)
                .and_then(|c| c.values().find(|d| filter.matches(d)).cloned()),
        })
    }

    async fn update(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
        patch: &JsonMap<String, JsonValue>,
    ) -> Result<Option<Document>, StoreError> {
        let fields = self.unique_fields(collection);
        match session {
            Some(session) => {
                let view = session.view_all(&self.data.read(), collection);
                let Some(mut doc) = view.get(id).cloned() else {
                    return Ok(None);
                };
                doc.merge(patch);
                if let Some(field) = unique_violation(&view, fields, &doc) {
                    return Err(StoreError::Duplicate(format!("{collection}.{field}")));
                }
                session.staged.push(Staged::Replace {
                    collection: collection.to_string(),
                    doc: doc.clone(),
                });
                Ok(Some(doc))
            }
            None => {
                let mut data = self.data.write();
                let Some(coll) = data.get_mut(collection) else {
                    return Ok(None);
                };
                let Some(mut doc) = coll.get(id).cloned() else {
                    return Ok(None);
                };
                doc.merge(patch);
                if let Some(field) = unique_violation(coll, fields, &doc) {
                    return Err(StoreError::Duplicate(format!("{collection}.{field}")));
                }
                coll.insert(doc.id.clone(), doc.clone());
                Ok(Some(doc))
            }
        }
    }

    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        match session {
            Some(session) => {
                let existing = session.view(&self.data.read(), collection, id);
                if existing.is_some() {
                    session.staged.push(Staged::Remove {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    });
                }
                Ok(existing)
            }
            None => Ok(self
                .data
                .write()
                .get_mut(collection)
                .and_then(|c| c.remove(id))),
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let data = self.data.read();
        Ok(data
            .get(collection)
            .map(|c| c.values().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn find_range(
        &self,
        collection: &str,
        query: &RangeQuery,
    ) -> Result<Vec<Document>, StoreError> {
        let data = self.data.read();
        let Some(coll) = data.get(collection) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<_> = coll
            .values()
            .filter(|d| query.filter.matches(d))
            .filter_map(|d| query.sort.extract(d).map(|v| (v, d)))
            .filter(|(v, d)| {
                query
                    .after
                    .as_ref()
                    .is_none_or(|after| after.admits(&query.sort, v, &d.id))
            })
            .collect();

        rows.sort_by(|(va, a), (vb, b)| query.sort.order((va, a.id.as_str()), (vb, b.id.as_str())));
        Ok(rows
            .into_iter()
            .take(query.limit)
            .map(|(_, d)| d.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str, email: &str) -> Document {
        Document::new(id, json!({"id": id, "email": email})).unwrap()
    }

    fn store() -> InMemoryDocumentStore {
        InMemoryDocumentStore::new().with_unique_index("users", "email")
    }

    #[tokio::test]
    async fn duplicate_id_and_unique_field_are_rejected() {
        let store = store();
        store.insert(None, "users", user("1", "a@x.io")).await.unwrap();
        assert!(matches!(
            store.insert(None, "users", user("1", "b@x.io")).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(matches!(
            store.insert(None, "users", user("2", "a@x.io")).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn session_writes_are_private_until_commit() {
        let store = store();
        let mut session = store.start_session().await.unwrap();
        store
            .insert(Some(&mut session), "users", user("1", "a@x.io"))
            .await
            .unwrap();

        assert!(store.get(None, "users", "1").await.unwrap().is_none());
        assert!(store.get(Some(&mut session), "users", "1").await.unwrap().is_some());

        session.commit().await.unwrap();
        assert!(store.get(None, "users", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn aborted_and_dropped_sessions_leave_no_trace() {
        let store = store();
        let mut session = store.start_session().await.unwrap();
        store
            .insert(Some(&mut session), "users", user("1", "a@x.io"))
            .await
            .unwrap();
        session.abort().await.unwrap();

        {
            let mut session = store.start_session().await.unwrap();
            store
                .insert(Some(&mut session), "users", user("2", "b@x.io"))
                .await
                .unwrap();
        }

        assert_eq!(store.count("users", &Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing_when_a_unique_key_was_taken_meanwhile() {
        let store = store();
        let mut session = store.start_session().await.unwrap();
        store
            .insert(Some(&mut session), "users", user("1", "a@x.io"))
            .await
            .unwrap();
        store
            .insert(Some(&mut session), "users", user("2", "b@x.io"))
            .await
            .unwrap();

        store.insert(None, "users", user("3", "b@x.io")).await.unwrap();

        assert!(matches!(session.commit().await, Err(StoreError::Duplicate(_))));
        assert!(store.get(None, "users", "1").await.unwrap().is_none());
        assert_eq!(store.count("users", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_inside_session_are_visible_to_it() {
        let store = store();
        store.insert(None, "users", user("1", "a@x.io")).await.unwrap();

        let mut session = store.start_session().await.unwrap();
        let patch = json!({"email": "new@x.io"});
        let updated = store
            .update(Some(&mut session), "users", "1", patch.as_object().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.body["email"], "new@x.io");

        let found = store
            .find_one(Some(&mut session), "users", &Filter::new().eq("email", "new@x.io"))
            .await
            .unwrap();
        assert_eq!(found.map(|d| d.id), Some("1".to_string()));

        assert!(store.delete(Some(&mut session), "users", "1").await.unwrap().is_some());
        assert!(store.get(Some(&mut session), "users", "1").await.unwrap().is_none());
        assert!(store.get(None, "users", "1").await.unwrap().is_some());

        session.commit().await.unwrap();
        assert!(store.get(None, "users", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_document_returns_none() {
        let store = store();
        let patch = json!({"email": "x"});
        assert!(store
            .update(None, "users", "nope", patch.as_object().unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mistyped_sort_values_are_skipped_by_range_reads() {
        crate::store::conformance::mistyped_sort_values_are_skipped(&store(), "memory").await;
    }
}
