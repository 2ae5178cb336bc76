//! Shared PostgreSQL plumbing: schema bootstrap and sqlx error mapping.
//!
//! | SQLx Error | PostgreSQL Error Code | Mapped to |
//! |------------|----------------------|-----------|
//! | Database (unique violation) | `23505` | [`PgFailure::UniqueViolation`] |
//! | Database (other) | any other | [`PgFailure::Other`] |
//! | PoolClosed / Io / other | N/A | [`PgFailure::Other`] |
//!
//! Each store turns a [`PgFailure`] into its own error type.

use sqlx::PgPool;

pub(crate) const TASKS_SCHEMA: &str = include_str!("../migrations/0001_tasks.sql");
pub(crate) const PROCESS_SCHEMA: &str = include_str!("../migrations/0002_process_state.sql");
pub(crate) const CMS_SCHEMA: &str = include_str!("../migrations/0003_cms.sql");

#[derive(Debug)]
pub(crate) enum PgFailure {
    UniqueViolation(String),
    Other(String),
}

impl PgFailure {
    pub(crate) fn into_message(self) -> String {
        match self {
            PgFailure::UniqueViolation(msg) | PgFailure::Other(msg) => msg,
        }
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PgFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => PgFailure::UniqueViolation(msg),
                _ => PgFailure::Other(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            PgFailure::Other(format!("connection pool closed in {}", operation))
        }
        _ => PgFailure::Other(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Apply idempotent DDL (`CREATE ... IF NOT EXISTS`).
pub(crate) async fn apply_schema(pool: &PgPool, name: &str, ddl: &str) -> Result<(), String> {
    sqlx::raw_sql(ddl)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx_error(name, e).into_message())
}

/// Clamp a row count or limit into Postgres `BIGINT`.
pub(crate) fn as_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
