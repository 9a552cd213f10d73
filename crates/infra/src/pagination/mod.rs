//! Keyset pagination.
//!
//! Pages are addressed by the `(primary sort value, id)` of the last row returned, never by
//! offset. Each page is fetched with a strict range predicate strictly after that position,
//! sorted by `(primary, id)`, over-fetching one row to learn whether another page exists.
//!
//! Guarantees under concurrent writes (no snapshot isolation):
//! - a row already returned is never returned again
//! - no row sorting between the last returned row and the next page's start is skipped

pub mod cursor;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use backoffice_core::{AppError, AppResult};

use crate::store::{Document, DocumentStore, Filter};

pub use cursor::{Cursor, CursorError, SortKind, SortValue};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Primary sort field plus direction. The document id is always the tiebreak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub kind: SortKind,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn descending(field: impl Into<String>, kind: SortKind) -> Self {
        Self {
            field: field.into(),
            kind,
            direction: SortDirection::Descending,
        }
    }

    pub fn ascending(field: impl Into<String>, kind: SortKind) -> Self {
        Self {
            field: field.into(),
            kind,
            direction: SortDirection::Ascending,
        }
    }

    /// Newest first by `createdAt`, the default ordering for list endpoints.
    pub fn newest_first() -> Self {
        Self::descending("createdAt", SortKind::Timestamp)
    }

    /// Read the primary sort value from a document.
    ///
    /// `None` when the field is missing or not of the expected kind; such documents never
    /// appear in keyset queries.
    pub fn extract(&self, doc: &Document) -> Option<SortValue> {
        let raw = doc.field(&self.field)?;
        match self.kind {
            SortKind::Timestamp => raw
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| SortValue::Timestamp(dt.timestamp_millis())),
            SortKind::Integer => raw.as_i64().map(SortValue::Integer),
            SortKind::Float => raw
                .as_f64()
                .filter(|f| f.is_finite())
                .map(SortValue::Float),
            SortKind::Text => raw.as_str().map(|s| SortValue::Text(s.to_string())),
        }
    }

    /// Compare two `(value, id)` positions in this sort's iteration order.
    pub fn order(&self, a: (&SortValue, &str), b: (&SortValue, &str)) -> Ordering {
        let natural = a.0.compare(b.0).then_with(|| a.1.cmp(b.1));
        match self.direction {
            SortDirection::Ascending => natural,
            SortDirection::Descending => natural.reverse(),
        }
    }

    fn cursor_for(&self, doc: &Document) -> AppResult<Cursor> {
        let value = self.extract(doc).ok_or_else(|| {
            AppError::Storage(format!(
                "document {} has no usable '{}' sort value",
                doc.id, self.field
            ))
        })?;
        Ok(Cursor::new(value, doc.id.clone())?)
    }
}

/// Strict "after this position" predicate.
///
/// Descending: `primary < v OR (primary = v AND id < tiebreak)`; ascending is symmetric.
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetPredicate {
    pub value: SortValue,
    pub tiebreak: String,
}

impl KeysetPredicate {
    pub fn from_cursor(cursor: Cursor) -> Self {
        let (value, tiebreak) = cursor.into_parts();
        Self { value, tiebreak }
    }

    pub fn admits(&self, sort: &SortSpec, value: &SortValue, id: &str) -> bool {
        sort.order((value, id), (&self.value, &self.tiebreak)) == Ordering::Greater
    }
}

/// A fully-specified range read handed to [`DocumentStore::find_range`].
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub filter: Filter,
    pub sort: SortSpec,
    pub after: Option<KeysetPredicate>,
    pub limit: usize,
}

/// Caller-facing page request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    pub fn after(limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            limit,
            cursor: Some(cursor.into()),
        }
    }

    /// Segment used in cache keys (`limit=20:cursor=...`).
    pub fn cache_segment(&self) -> String {
        format!(
            "limit={}:cursor={}",
            self.limit,
            self.cursor.as_deref().unwrap_or("-")
        )
    }
}

/// One page of results. `next_cursor` is set exactly when `has_next_page` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    items: Vec<T>,
    next_cursor: Option<String>,
    has_next_page: bool,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            has_next_page: false,
        }
    }

    pub fn with_next(items: Vec<T>, next: &Cursor) -> Self {
        Self {
            items,
            next_cursor: Some(next.encode()),
            has_next_page: true,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn has_next_page(&self) -> bool {
        self.has_next_page
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        let items = self.items.into_iter().map(f).collect::<Result<Vec<_>, E>>()?;
        Ok(Page {
            items,
            next_cursor: self.next_cursor,
            has_next_page: self.has_next_page,
        })
    }
}

fn validate_limit(limit: usize) -> AppResult<()> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(AppError::validation(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
        )));
    }
    Ok(())
}

/// Fetch one keyset page of `collection`.
pub async fn paginate<S: DocumentStore>(
    store: &S,
    collection: &str,
    filter: &Filter,
    sort: &SortSpec,
    request: &PageRequest,
) -> AppResult<Page<Document>> {
    validate_limit(request.limit)?;

    let after = match request.cursor.as_deref() {
        Some(raw) => Some(KeysetPredicate::from_cursor(Cursor::decode(raw, sort.kind)?)),
        None => None,
    };

    let query = RangeQuery {
        filter: filter.clone(),
        sort: sort.clone(),
        after,
        limit: request.limit + 1,
    };

    let mut rows = store.find_range(collection, &query).await?;

    let has_next_page = rows.len() > request.limit;
    rows.truncate(request.limit);

    debug!(
        collection = %collection,
        returned = rows.len(),
        has_next_page,
        "keyset page fetched"
    );

    if !has_next_page {
        return Ok(Page::last(rows));
    }
    let next = match rows.last() {
        Some(last) => sort.cursor_for(last)?,
        None => return Ok(Page::last(rows)),
    };
    Ok(Page::with_next(rows, &next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn doc(id: &str, created_ms: i64, status: &str) -> Document {
        let created = chrono::DateTime::from_timestamp_millis(created_ms)
            .unwrap()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        Document::new(id, json!({"id": id, "createdAt": created, "status": status})).unwrap()
    }

    async fn seeded(rows: &[(&str, i64)]) -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        for (id, ms) in rows {
            store.insert(None, "tickets", doc(id, *ms, "Open")).await.unwrap();
        }
        store
    }

    async fn collect_all(
        store: &InMemoryDocumentStore,
        sort: &SortSpec,
        limit: usize,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        let mut request = PageRequest::first(limit);
        loop {
            let page = paginate(store, "tickets", &Filter::new(), sort, &request)
                .await
                .unwrap();
            assert!(page.items().len() <= limit);
            assert_eq!(page.has_next_page(), page.next_cursor().is_some());
            ids.extend(page.items().iter().map(|d| d.id.clone()));
            match page.next_cursor() {
                Some(c) => request = PageRequest::after(limit, c),
                None => break,
            }
        }
        ids
    }

    #[tokio::test]
    async fn empty_collection_yields_empty_last_page() {
        let store = InMemoryDocumentStore::new();
        let page = paginate(
            &store,
            "tickets",
            &Filter::new(),
            &SortSpec::newest_first(),
            &PageRequest::first(10),
        )
        .await
        .unwrap();
        assert!(page.items().is_empty());
        assert!(!page.has_next_page());
        assert_eq!(page.next_cursor(), None);
    }

    #[tokio::test]
    async fn ties_on_primary_are_broken_by_id() {
        let store = seeded(&[("a", 5), ("b", 5), ("c", 5), ("d", 5), ("e", 1)]).await;
        let ids = collect_all(&store, &SortSpec::newest_first(), 2).await;
        assert_eq!(ids, vec!["d", "c", "b", "a", "e"]);
    }

    #[tokio::test]
    async fn exact_multiple_of_limit_has_no_dangling_page() {
        let store = seeded(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]).await;
        let first = paginate(
            &store,
            "tickets",
            &Filter::new(),
            &SortSpec::ascending("createdAt", SortKind::Timestamp),
            &PageRequest::first(2),
        )
        .await
        .unwrap();
        assert!(first.has_next_page());
        let second = paginate(
            &store,
            "tickets",
            &Filter::new(),
            &SortSpec::ascending("createdAt", SortKind::Timestamp),
            &PageRequest::after(2, first.next_cursor().unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(second.items().len(), 2);
        assert!(!second.has_next_page());
    }

    #[tokio::test]
    async fn concurrent_insert_is_neither_duplicated_nor_skipped() {
        let store = seeded(&[("a", 10), ("b", 20), ("c", 30), ("d", 40)]).await;
        let sort = SortSpec::newest_first();
        let first = paginate(&store, "tickets", &Filter::new(), &sort, &PageRequest::first(2))
            .await
            .unwrap();
        let first_ids: Vec<_> = first.items().iter().map(|d| d.id.clone()).collect();
        assert_eq!(first_ids, vec!["d", "c"]);

        // Lands between the cursor and the next unread row.
        store.insert(None, "tickets", doc("bb", 25, "Open")).await.unwrap();
        // Sorts before the cursor: already "behind" the reader.
        store.insert(None, "tickets", doc("z", 50, "Open")).await.unwrap();

        let second = paginate(
            &store,
            "tickets",
            &Filter::new(),
            &sort,
            &PageRequest::after(10, first.next_cursor().unwrap()),
        )
        .await
        .unwrap();
        let second_ids: Vec<_> = second.items().iter().map(|d| d.id.clone()).collect();
        assert_eq!(second_ids, vec!["bb", "b", "a"]);
    }

    #[tokio::test]
    async fn filter_restricts_rows() {
        let store = InMemoryDocumentStore::new();
        store.insert(None, "tickets", doc("a", 1, "Open")).await.unwrap();
        store.insert(None, "tickets", doc("b", 2, "Resolved")).await.unwrap();
        let page = paginate(
            &store,
            "tickets",
            &Filter::new().eq("status", "Resolved"),
            &SortSpec::newest_first(),
            &PageRequest::first(10),
        )
        .await
        .unwrap();
        assert_eq!(page.items().len(), 1);
        assert_eq!(page.items()[0].id, "b");
    }

    #[tokio::test]
    async fn malformed_cursor_is_an_error_not_a_first_page() {
        let store = seeded(&[("a", 1)]).await;
        let err = paginate(
            &store,
            "tickets",
            &Filter::new(),
            &SortSpec::newest_first(),
            &PageRequest::after(10, "garbage"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn limit_bounds_are_enforced() {
        let store = InMemoryDocumentStore::new();
        for limit in [0, MAX_PAGE_SIZE + 1] {
            let err = paginate(
                &store,
                "tickets",
                &Filter::new(),
                &SortSpec::newest_first(),
                &PageRequest::first(limit),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn float_scores_progress_through_the_tiebreak() {
        let store = InMemoryDocumentStore::new();
        for (id, score) in [("a", 0.5), ("b", 0.5), ("c", 0.75), ("d", 0.5), ("e", 0.1)] {
            store
                .insert(None, "products", Document::new(id, json!({"id": id, "score": score})).unwrap())
                .await
                .unwrap();
        }
        let sort = SortSpec::descending("score", SortKind::Float);
        let mut ids = Vec::new();
        let mut request = PageRequest::first(1);
        loop {
            let page = paginate(&store, "products", &Filter::new(), &sort, &request)
                .await
                .unwrap();
            ids.extend(page.items().iter().map(|d| d.id.clone()));
            match page.next_cursor() {
                Some(c) => request = PageRequest::after(1, c),
                None => break,
            }
        }
        assert_eq!(ids, vec!["c", "d", "b", "a", "e"]);
    }

    #[test]
    fn page_serializes_in_camel_case() {
        let page: Page<u32> = Page::last(vec![1, 2]);
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(
            json,
            json!({"items": [1, 2], "nextCursor": null, "hasNextPage": false})
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn paging_visits_every_row_exactly_once(
            stamps in proptest::collection::vec(0i64..20, 0..40),
            limit in 1usize..7,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let rows: Vec<(String, i64)> = stamps
                    .iter()
                    .enumerate()
                    .map(|(i, ms)| (format!("id{i:03}"), *ms))
                    .collect();
                let borrowed: Vec<(&str, i64)> = rows.iter().map(|(id, ms)| (id.as_str(), *ms)).collect();
                let store = seeded(&borrowed).await;

                let ids = collect_all(&store, &SortSpec::newest_first(), limit).await;
                let unique: HashSet<_> = ids.iter().cloned().collect();
                assert_eq!(ids.len(), rows.len());
                assert_eq!(unique.len(), rows.len());

                let mut expected = rows.clone();
                expected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                let expected: Vec<String> = expected.into_iter().map(|(id, _)| id).collect();
                assert_eq!(ids, expected);
            });
        }
    }
}
