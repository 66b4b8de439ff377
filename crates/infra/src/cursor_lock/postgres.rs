//! Postgres-backed listener cursor store.
//!
//! One row per listener in `listener_cursors`. Lock acquisition is a single
//! conditional `UPDATE ... RETURNING`; an empty result means another holder's
//! lock is still live. Releases use `GREATEST` so the stored watermark never
//! moves backwards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use lattice_core::ListenerId;
use lattice_events::EventCursor;

use super::store::CursorStore;
use crate::error::{StoreError, map_sqlx_error};

/// Postgres-backed cursor store.
#[derive(Debug, Clone)]
pub struct PostgresCursorStore {
    pool: Arc<PgPool>,
}

impl PostgresCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn encode_cursor(cursor: EventCursor) -> i64 {
    i64::try_from(cursor.position()).unwrap_or(i64::MAX)
}

fn decode_cursor(operation: &str, row: &sqlx::postgres::PgRow) -> Result<EventCursor, StoreError> {
    let value: i64 = row
        .try_get("cursor_value")
        .map_err(|e| map_sqlx_error(operation, e))?;
    u64::try_from(value)
        .map(EventCursor::new)
        .map_err(|_| StoreError::Decode {
            operation: operation.to_string(),
            message: format!("negative cursor value {value}"),
        })
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    #[instrument(skip(self), fields(listener_id = %listener_id), err)]
    async fn ensure_listener(
        &self,
        listener_id: &ListenerId,
        initial: EventCursor,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listener_cursors (listener_id, cursor_value)
            VALUES ($1, $2)
            ON CONFLICT (listener_id) DO NOTHING
            "#,
        )
        .bind(listener_id.as_str())
        .bind(encode_cursor(initial))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_listener", e))?;
        Ok(())
    }

    #[instrument(skip(self, now, locked_until), fields(listener_id = %listener_id), err)]
    async fn try_acquire(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<EventCursor>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE listener_cursors
            SET locked_by = $2, locked_until = $4, updated_at = NOW()
            WHERE listener_id = $1
              AND (locked_until IS NULL OR locked_until < $3 OR locked_by = $2)
            RETURNING cursor_value
            "#,
        )
        .bind(listener_id.as_str())
        .bind(locked_by)
        .bind(now)
        .bind(locked_until)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire", e))?;

        row.map(|row| decode_cursor("try_acquire", &row)).transpose()
    }

    #[instrument(skip(self, locked_until), fields(listener_id = %listener_id), err)]
    async fn renew(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listener_cursors
            SET locked_until = $3, updated_at = NOW()
            WHERE listener_id = $1 AND locked_by = $2
            "#,
        )
        .bind(listener_id.as_str())
        .bind(locked_by)
        .bind(locked_until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(listener_id = %listener_id), err)]
    async fn release(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        new_cursor: Option<EventCursor>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listener_cursors
            SET cursor_value = GREATEST(cursor_value, COALESCE($3, cursor_value)),
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE listener_id = $1 AND locked_by = $2
            "#,
        )
        .bind(listener_id.as_str())
        .bind(locked_by)
        .bind(new_cursor.map(encode_cursor))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_cursor(
        &self,
        listener_id: &ListenerId,
    ) -> Result<Option<EventCursor>, StoreError> {
        let row = sqlx::query("SELECT cursor_value FROM listener_cursors WHERE listener_id = $1")
            .bind(listener_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_cursor", e))?;

        row.map(|row| decode_cursor("get_cursor", &row)).transpose()
    }
}
