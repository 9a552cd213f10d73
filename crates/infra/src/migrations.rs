//! Schema migrations for the Postgres backends.
//!
//! Migrations are embedded at compile time and applied in order, each in its own
//! transaction. Applied versions are recorded in `schema_migrations`.

use sqlx::{PgPool, Row};
use tracing::{info, instrument};

/// An embedded migration script.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "documents",
        sql: include_str!("../migrations/0001_documents.sql"),
    },
    Migration {
        version: 2,
        name: "jobs",
        sql: include_str!("../migrations/0002_jobs.sql"),
    },
    Migration {
        version: 3,
        name: "job_leases",
        sql: include_str!("../migrations/0003_job_leases.sql"),
    },
    Migration {
        version: 4,
        name: "sort_casts",
        sql: include_str!("../migrations/0004_sort_casts.sql"),
    },
];

/// Apply every migration not yet recorded. Returns the versions applied by this call.
#[instrument(skip(pool), err)]
pub async fn run(pool: &PgPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    BIGINT      PRIMARY KEY,
            name       TEXT        NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("version"))
        .collect::<Result<_, _>>()?;

    let mut newly_applied = Vec::new();
    for migration in pending(MIGRATIONS, &applied) {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(version = migration.version, name = migration.name, "migration applied");
        newly_applied.push(migration.version);
    }
    Ok(newly_applied)
}

fn pending<'a>(
    migrations: &'a [Migration],
    applied: &'a [i64],
) -> impl Iterator<Item = &'a Migration> + 'a {
    migrations
        .iter()
        .filter(move |m| !applied.contains(&m.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert!(MIGRATIONS.iter().all(|m| !m.sql.trim().is_empty()));
    }

    #[test]
    fn pending_skips_applied_versions() {
        let versions: Vec<i64> = pending(MIGRATIONS, &[1]).map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
        assert_eq!(pending(MIGRATIONS, &[1, 2, 3, 4]).count(), 0);
    }
}
