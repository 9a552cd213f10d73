//! Postgres-backed job store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so several worker processes can poll the same
//! table without handing one job to two workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Row};
use tracing::instrument;

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus};

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| JobStoreError::Storage(format!("failed to read job row: {e}")))?;
    serde_json::from_value(body)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job: {e}")))
}

fn encode_job(job: &Job) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(job)
        .map_err(|e| JobStoreError::Storage(format!("failed to serialize job: {e}")))
}

async fn write_job<'c, E>(exec: E, job: &Job) -> Result<u64, JobStoreError>
where
    E: Executor<'c, Database = Postgres>,
{
    let body = encode_job(job)?;
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, priority = $3, run_at = $4, updated_at = $5, body = $6,
            locked_until = $7
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.label())
    .bind(job.priority)
    .bind(job.run_at)
    .bind(job.updated_at)
    .bind(body)
    .bind(job.locked_until)
    .execute(exec)
    .await
    .map_err(|e| map_sqlx_error("update", e))?;
    Ok(result.rows_affected())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type()), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let body = encode_job(&job)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, priority, run_at, created_at, updated_at, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(job.job_type())
        .bind(job.status.label())
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(body)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;
        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = job.status.label()), err)]
    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        if write_job(&*self.pool, job).await? == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let row = sqlx::query(
            r#"
            SELECT body FROM jobs
            WHERE status IN ('pending', 'failed') AND run_at <= $1
            ORDER BY priority DESC, run_at, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        job.mark_running(now, lease);
        write_job(&mut *tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(Some(job))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn renew_lease(&self, job_id: JobId, locked_until: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let until = serde_json::to_value(locked_until)
            .map_err(|e| JobStoreError::Storage(format!("failed to serialize lease: {e}")))?;
        let renewed = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_until = $2, body = jsonb_set(body, '{locked_until}', $3)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id.0)
        .bind(locked_until)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?
        .rows_affected();
        Ok(renewed > 0)
    }

    #[instrument(skip(self), err)]
    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("recover_stalled", e))?;

        let rows = sqlx::query(
            r#"
            SELECT body FROM jobs
            WHERE status = 'running' AND (locked_until IS NULL OR locked_until <= $1)
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stalled", e))?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            job.recover_stalled(now);
            if job.remove_on_fail && matches!(job.status, JobStatus::DeadLettered { .. }) {
                sqlx::query("DELETE FROM jobs WHERE id = $1")
                    .bind(job.id.0)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("recover_stalled", e))?;
            } else {
                write_job(&mut *tx, &job).await?;
            }
            recovered.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("recover_stalled", e))?;
        Ok(recovered)
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM jobs
            WHERE status = 'dead_lettered'
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        let row = sqlx::query("SELECT body FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = decode_job(&row)?;
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            return Err(JobStoreError::NotDeadLettered(job_id));
        }
        job.reset_for_retry(now);
        write_job(&mut *tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'dead_lettered'")
            .bind(job_id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?
            .rows_affected();
        if deleted == 0 {
            return match self.get(job_id).await? {
                Some(_) => Err(JobStoreError::NotDeadLettered(job_id)),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            let n = usize::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending += n,
                "running" => stats.running += n,
                "completed" => stats.completed += n,
                "failed" => stats.failed += n,
                "dead_lettered" => stats.dead_lettered += n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
