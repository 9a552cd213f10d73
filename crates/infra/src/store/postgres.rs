//! Postgres-backed document store.
//!
//! Every collection lives in the single `documents` table as `jsonb` bodies keyed by
//! `(collection, id)`. Unique fields are enforced by partial expression indexes declared in
//! the migrations.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (invalid text representation / datetime format) | `22P02` / `22007` | `InvalidDocument` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! ## Keyset Queries
//!
//! The primary sort field is extracted and cast per [`SortKind`]: timestamps are truncated
//! to milliseconds (the cursor precision), text and ids compare under `COLLATE "C"` so the
//! SQL order matches byte order. A value of the wrong kind (a fractional number under an
//! integer sort, a malformed timestamp) casts to NULL and the row is skipped, the same rows
//! the in-memory store skips.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{Document, DocumentStore, Filter, StoreError, StoreSession};
use crate::pagination::{RangeQuery, SortDirection, SortKind, SortSpec, SortValue};

/// Postgres document store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// A database transaction. Dropping it without commit rolls it back.
#[derive(Debug)]
pub struct PostgresSession {
    id: Uuid,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreSession for PostgresSession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn commit(self) -> Result<(), StoreError> {
        let id = self.id;
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        debug!(session_id = %id, "session committed");
        Ok(())
    }

    async fn abort(self) -> Result<(), StoreError> {
        let id = self.id;
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("abort", e))?;
        debug!(session_id = %id, "session rolled back");
        Ok(())
    }
}

fn row_to_document(row: &PgRow) -> Result<Document, StoreError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| StoreError::backend("decode", e.to_string()))?;
    let body: JsonValue = row
        .try_get("body")
        .map_err(|e| StoreError::backend("decode", e.to_string()))?;
    Document::new(id, body)
}

async fn insert_row<'c, E>(exec: E, collection: &str, doc: &Document) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)")
        .bind(collection)
        .bind(&doc.id)
        .bind(&doc.body)
        .execute(exec)
        .await?;
    Ok(())
}

async fn select_by_id<'c, E>(exec: E, collection: &str, id: &str) -> Result<Option<PgRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("SELECT id, body FROM documents WHERE collection = $1 AND id = $2")
        .bind(collection)
        .bind(id)
        .fetch_optional(exec)
        .await
}

async fn select_matching<'c, E>(
    exec: E,
    collection: &str,
    filter: &Filter,
) -> Result<Option<PgRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        SELECT id, body FROM documents
        WHERE collection = $1 AND body @> $2
        ORDER BY id COLLATE "C"
        LIMIT 1
        "#,
    )
    .bind(collection)
    .bind(filter.as_json())
    .fetch_optional(exec)
    .await
}

async fn merge_row<'c, E>(
    exec: E,
    collection: &str,
    id: &str,
    patch: &JsonMap<String, JsonValue>,
) -> Result<Option<PgRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE documents
        SET body = body || ($3::jsonb - 'id'), updated_at = now()
        WHERE collection = $1 AND id = $2
        RETURNING id, body
        "#,
    )
    .bind(collection)
    .bind(id)
    .bind(JsonValue::Object(patch.clone()))
    .fetch_optional(exec)
    .await
}

async fn delete_row<'c, E>(exec: E, collection: &str, id: &str) -> Result<Option<PgRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2 RETURNING id, body")
        .bind(collection)
        .bind(id)
        .fetch_optional(exec)
        .await
}

/// RFC 3339 date-time, the only timestamp shape documents are sorted by.
const RFC3339_PATTERN: &str =
    "^[0-9]{4}-[0-9]{2}-[0-9]{2}[Tt ][0-9]{2}:[0-9]{2}:[0-9]{2}([.][0-9]+)?([Zz]|[+-][0-9]{2}:[0-9]{2})$";

fn push_field_text(qb: &mut QueryBuilder<'_, Postgres>, field: &str) {
    qb.push("(body->>");
    qb.push_bind(field.to_string());
    qb.push(")");
}

fn push_field_type_is(qb: &mut QueryBuilder<'_, Postgres>, field: &str, json_type: &'static str) {
    qb.push("jsonb_typeof(body->");
    qb.push_bind(field.to_string());
    qb.push(format!(") = '{json_type}'"));
}

/// Push the typed sort expression for `sort.field`.
///
/// Evaluates to NULL whenever the stored value is not of the sort's kind: integers must be
/// whole JSON numbers within `i64`, timestamps RFC 3339 strings, floats JSON numbers and
/// text JSON strings. Never raises a cast error.
fn push_sort_expr(qb: &mut QueryBuilder<'_, Postgres>, sort: &SortSpec) {
    let field = sort.field.as_str();
    match sort.kind {
        SortKind::Timestamp => {
            qb.push("date_trunc('milliseconds', CASE WHEN ");
            push_field_type_is(qb, field, "string");
            qb.push(" AND ");
            push_field_text(qb, field);
            qb.push(format!(" ~ '{RFC3339_PATTERN}' THEN try_timestamptz"));
            push_field_text(qb, field);
            qb.push(" END)");
        }
        SortKind::Integer => {
            qb.push("CASE WHEN ");
            push_field_type_is(qb, field, "number");
            qb.push(" AND ");
            push_field_text(qb, field);
            qb.push(" ~ '^-?[0-9]{1,19}$' THEN CASE WHEN ");
            push_field_text(qb, field);
            qb.push("::numeric BETWEEN -9223372036854775808 AND 9223372036854775807 THEN ");
            push_field_text(qb, field);
            qb.push("::numeric END END");
        }
        SortKind::Float => {
            qb.push("CASE WHEN ");
            push_field_type_is(qb, field, "number");
            qb.push(" THEN ");
            push_field_text(qb, field);
            qb.push("::float8 END");
        }
        SortKind::Text => {
            qb.push("(CASE WHEN ");
            push_field_type_is(qb, field, "string");
            qb.push(" THEN ");
            push_field_text(qb, field);
            qb.push(" END) COLLATE \"C\"");
        }
    }
}

/// Only rows with a usable sort value take part in keyset reads.
fn push_sort_guard(qb: &mut QueryBuilder<'_, Postgres>, sort: &SortSpec) {
    qb.push(" AND ");
    push_sort_expr(qb, sort);
    qb.push(" IS NOT NULL");
}

fn push_sort_value(qb: &mut QueryBuilder<'_, Postgres>, value: &SortValue) -> Result<(), StoreError> {
    match value {
        SortValue::Timestamp(ms) => {
            let at: DateTime<Utc> = DateTime::from_timestamp_millis(*ms).ok_or_else(|| {
                StoreError::InvalidDocument(format!("timestamp out of range: {ms}"))
            })?;
            qb.push_bind(at);
        }
        SortValue::Integer(n) => {
            qb.push_bind(*n);
            qb.push("::numeric");
        }
        SortValue::Float(f) => {
            qb.push_bind(*f);
        }
        SortValue::Text(s) => {
            qb.push_bind(s.clone());
            qb.push(" COLLATE \"C\"");
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    type Session = PostgresSession;

    #[instrument(skip(self), err)]
    async fn start_session(&self) -> Result<Self::Session, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("start_session", e))?;
        Ok(PostgresSession {
            id: Uuid::now_v7(),
            tx,
        })
    }

    #[instrument(skip(self, session, doc), fields(collection = %collection, id = %doc.id), err)]
    async fn insert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        doc: Document,
    ) -> Result<(), StoreError> {
        let result = match session {
            Some(s) => insert_row(&mut *s.tx, collection, &doc).await,
            None => insert_row(&*self.pool, collection, &doc).await,
        };
        result.map_err(|e| map_sqlx_error("insert", e))
    }

    #[instrument(skip(self, session), err)]
    async fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = match session {
            Some(s) => select_by_id(&mut *s.tx, collection, id).await,
            None => select_by_id(&*self.pool, collection, id).await,
        }
        .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(skip(self, session, filter), err)]
    async fn find_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let row = match session {
            Some(s) => select_matching(&mut *s.tx, collection, filter).await,
            None => select_matching(&*self.pool, collection, filter).await,
        }
        .map_err(|e| map_sqlx_error("find_one", e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(skip(self, session, patch), err)]
    async fn update(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
        patch: &JsonMap<String, JsonValue>,
    ) -> Result<Option<Document>, StoreError> {
        let row = match session {
            Some(s) => merge_row(&mut *s.tx, collection, id, patch).await,
            None => merge_row(&*self.pool, collection, id, patch).await,
        }
        .map_err(|e| map_sqlx_error("update", e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(skip(self, session), err)]
    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = match session {
            Some(s) => delete_row(&mut *s.tx, collection, id).await,
            None => delete_row(&*self.pool, collection, id).await,
        }
        .map_err(|e| map_sqlx_error("delete", e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(skip(self, filter), err)]
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE collection = $1 AND body @> $2",
        )
        .bind(collection)
        .bind(filter.as_json())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, query), fields(collection = %collection, limit = query.limit), err)]
    async fn find_range(
        &self,
        collection: &str,
        query: &RangeQuery,
    ) -> Result<Vec<Document>, StoreError> {
        let sort = &query.sort;
        let (cmp, order) = match sort.direction {
            SortDirection::Descending => ("<", "DESC"),
            SortDirection::Ascending => (">", "ASC"),
        };

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT id, body FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        if !query.filter.is_empty() {
            qb.push(" AND body @> ");
            qb.push_bind(query.filter.as_json());
        }
        push_sort_guard(&mut qb, sort);

        if let Some(after) = &query.after {
            qb.push(" AND (");
            push_sort_expr(&mut qb, sort);
            qb.push(format!(" {cmp} "));
            push_sort_value(&mut qb, &after.value)?;
            qb.push(" OR (");
            push_sort_expr(&mut qb, sort);
            qb.push(" = ");
            push_sort_value(&mut qb, &after.value)?;
            qb.push(format!(" AND id COLLATE \"C\" {cmp} "));
            qb.push_bind(after.tiebreak.clone());
            qb.push(" COLLATE \"C\"))");
        }

        qb.push(" ORDER BY ");
        push_sort_expr(&mut qb, sort);
        qb.push(format!(" {order}, id COLLATE \"C\" {order} LIMIT "));
        qb.push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_range", e))?;

        rows.iter().map(row_to_document).collect()
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(
                    db_err
                        .constraint()
                        .map(str::to_string)
                        .unwrap_or(msg),
                ),
                Some("22P02") | Some("22007") | Some("22008") => StoreError::InvalidDocument(msg),
                _ => StoreError::backend(operation, msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::backend(operation, "connection pool closed"),
        other => StoreError::backend(operation, other.to_string()),
    }
}
