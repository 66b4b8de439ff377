//! Database adapters: pool construction and schema bootstrap.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{ConfigError, required_env};
use crate::error::{StoreError, map_sqlx_error};

/// DDL for the job, token and cursor tables. Idempotent.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id               UUID PRIMARY KEY,
    queue_name       TEXT        NOT NULL,
    tenant_id        TEXT        NOT NULL,
    payload          JSONB       NOT NULL,
    process_after    TIMESTAMPTZ NOT NULL,
    claimed_by       TEXT,
    claimed_until    TIMESTAMPTZ,
    failed_count     INTEGER     NOT NULL DEFAULT 0,
    last_error       TEXT,
    completed_at     TIMESTAMPTZ,
    dead_lettered_at TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS queue_jobs_claimable_idx
    ON queue_jobs (queue_name, tenant_id, process_after)
    WHERE completed_at IS NULL AND dead_lettered_at IS NULL;

CREATE INDEX IF NOT EXISTS queue_jobs_dead_letter_idx
    ON queue_jobs (queue_name, dead_lettered_at)
    WHERE dead_lettered_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS queue_tokens (
    id           UUID        PRIMARY KEY,
    queue_name   TEXT        NOT NULL,
    tenant_id    TEXT        NOT NULL,
    leased_by    TEXT        NOT NULL,
    leased_until TIMESTAMPTZ NOT NULL,
    UNIQUE (queue_name, tenant_id)
);

CREATE TABLE IF NOT EXISTS listener_cursors (
    listener_id  TEXT        PRIMARY KEY,
    cursor_value BIGINT      NOT NULL DEFAULT 0,
    locked_by    TEXT,
    locked_until TIMESTAMPTZ,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Build a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Build a pool from `DATABASE_URL` (and optional `DATABASE_MAX_CONNECTIONS`, default 10).
pub async fn connect_from_env() -> Result<PgPool, DbSetupError> {
    let url = required_env("DATABASE_URL")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::InvalidValue {
                key: "DATABASE_MAX_CONNECTIONS".to_string(),
                message: e.to_string(),
            }
        })?,
        Err(_) => 10,
    };
    Ok(connect(&url, max_connections).await?)
}

/// Apply [`SCHEMA_SQL`].
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    info!("queue schema ensured");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DbSetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
