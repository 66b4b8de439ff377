//! Postgres-backed token pool and job store.
//!
//! ## Concurrency
//!
//! - Token leasing inserts into `queue_tokens`, which is unique per
//!   `(queue_name, tenant_id)`. A conflicting row is only taken over when its
//!   lease expired, so concurrent leasers never both win a pair.
//! - Job claiming selects candidates with `FOR UPDATE SKIP LOCKED`, so
//!   concurrent claimers partition the rows instead of blocking on each other.
//! - Completion, retry and dead-lettering are conditional on `claimed_by`;
//!   zero affected rows means the claim was lost.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use lattice_core::{JobId, TenantId, TokenId};

use super::store::{JobStore, TokenPool};
use super::types::{ClaimRequest, Job, LeaseRequest, NewJob, QueueStats, Token};
use crate::error::{StoreError, map_sqlx_error};

const JOB_COLUMNS: &str = "id, queue_name, tenant_id, payload, process_after, claimed_by, \
     claimed_until, failed_count, last_error, completed_at, dead_lettered_at, created_at";

const CLAIMED_JOB_COLUMNS: &str = "queue_jobs.id, queue_jobs.queue_name, queue_jobs.tenant_id, \
     queue_jobs.payload, queue_jobs.process_after, queue_jobs.claimed_by, queue_jobs.claimed_until, \
     queue_jobs.failed_count, queue_jobs.last_error, queue_jobs.completed_at, \
     queue_jobs.dead_lettered_at, queue_jobs.created_at";

/// Postgres-backed queue store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl TokenPool for PostgresQueueStore {
    #[instrument(skip(self, request), fields(leased_by = %request.leased_by, limit = request.limit, leased), err)]
    async fn batch_lease_tokens(&self, request: &LeaseRequest) -> Result<Vec<Token>, StoreError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT j.queue_name, j.tenant_id, MIN(j.process_after) AS oldest
                FROM queue_jobs j
                WHERE j.completed_at IS NULL
                  AND j.dead_lettered_at IS NULL
                  AND j.process_after <= $2
                  AND (j.claimed_until IS NULL OR j.claimed_until < $2)
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_tokens t
                      WHERE t.queue_name = j.queue_name
                        AND t.tenant_id = j.tenant_id
                        AND t.leased_until >= $2
                  )
                GROUP BY j.queue_name, j.tenant_id
                ORDER BY oldest, j.queue_name, j.tenant_id
                LIMIT $4
            )
            INSERT INTO queue_tokens (id, queue_name, tenant_id, leased_by, leased_until)
            SELECT gen_random_uuid(), queue_name, tenant_id, $1, $3 FROM candidates
            ON CONFLICT (queue_name, tenant_id) DO UPDATE
                SET id = EXCLUDED.id,
                    leased_by = EXCLUDED.leased_by,
                    leased_until = EXCLUDED.leased_until
                WHERE queue_tokens.leased_until < $2
            RETURNING id, queue_name, tenant_id, leased_by, leased_until
            "#,
        )
        .bind(&request.leased_by)
        .bind(request.now)
        .bind(request.lease_until)
        .bind(to_i64(request.limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("batch_lease_tokens", e))?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in rows {
            let row = TokenRow::from_row(&row).map_err(|e| map_sqlx_error("batch_lease_tokens", e))?;
            tokens.push(row.into_token("batch_lease_tokens")?);
        }

        Span::current().record("leased", tokens.len());
        Ok(tokens)
    }

    #[instrument(skip(self), fields(token_id = %token_id), err)]
    async fn delete_token(&self, token_id: TokenId, leased_by: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_tokens WHERE id = $1 AND leased_by = $2")
            .bind(*token_id.as_uuid())
            .bind(leased_by)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_token", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresQueueStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_name, tenant_id = %job.tenant_id), err)]
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue_name, tenant_id, payload, process_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(&job.queue_name)
        .bind(job.tenant_id.as_str())
        .bind(&job.payload)
        .bind(job.process_after)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(job.id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| decode_job("get_job", &row)).transpose()
    }

    #[instrument(
        skip(self, request),
        fields(queue = %request.queue_name, tenant_id = %request.tenant_id, claimed),
        err
    )]
    async fn batch_claim_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>, StoreError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            WITH picked AS (
                SELECT id FROM queue_jobs
                WHERE queue_name = $1
                  AND tenant_id = $2
                  AND completed_at IS NULL
                  AND dead_lettered_at IS NULL
                  AND process_after <= $4
                  AND (claimed_until IS NULL OR claimed_until < $4)
                ORDER BY process_after, id
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET claimed_by = $3, claimed_until = $5
            FROM picked
            WHERE queue_jobs.id = picked.id
            RETURNING {CLAIMED_JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(&request.queue_name)
            .bind(request.tenant_id.as_str())
            .bind(&request.claimed_by)
            .bind(request.now)
            .bind(request.claimed_until)
            .bind(to_i64(request.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("batch_claim_jobs", e))?;

        let mut jobs = rows
            .iter()
            .map(|row| decode_job("batch_claim_jobs", row))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| (j.process_after, j.id));

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, job_ids), fields(jobs = job_ids.len()), err)]
    async fn batch_renew_claims(
        &self,
        job_ids: &[JobId],
        claimed_by: &str,
        claimed_until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<uuid::Uuid> = job_ids.iter().map(|id| *id.as_uuid()).collect();

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET claimed_until = $3
            WHERE id = ANY($1)
              AND claimed_by = $2
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(&ids)
        .bind(claimed_by)
        .bind(claimed_until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("batch_renew_claims", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET completed_at = $3, claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
              AND claimed_by = $2
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(claimed_by)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn retry_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        process_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET failed_count = $3,
                last_error = $4,
                process_after = $5,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
              AND claimed_by = $2
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(claimed_by)
        .bind(to_i32(failed_count))
        .bind(error)
        .bind(process_after)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn dead_letter_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET failed_count = $3,
                last_error = $4,
                dead_lettered_at = $5,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
              AND claimed_by = $2
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(claimed_by)
        .bind(to_i32(failed_count))
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_dead_letters(
        &self,
        queue_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM queue_jobs
            WHERE dead_lettered_at IS NOT NULL
              AND ($1::TEXT IS NULL OR queue_name = $1)
            ORDER BY dead_lettered_at, id
            LIMIT $2
            "#
        ))
        .bind(queue_name)
        .bind(to_i64(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| decode_job("list_dead_letters", row))
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET dead_lettered_at = NULL, failed_count = 0, process_after = $2
            WHERE id = $1 AND dead_lettered_at IS NOT NULL
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn queue_stats(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND dead_lettered_at IS NULL
                      AND (claimed_until IS NULL OR claimed_until < $2)
                ) AS pending,
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND dead_lettered_at IS NULL
                      AND claimed_until >= $2
                ) AS claimed,
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL) AS completed,
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND dead_lettered_at IS NOT NULL
                ) AS dead_lettered
            FROM queue_jobs
            WHERE queue_name = $1
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("queue_stats", e))?;
            Ok(u64::try_from(value).unwrap_or(0))
        };

        Ok(QueueStats {
            pending: count("pending")?,
            claimed: count("claimed")?,
            completed: count("completed")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    tenant_id: String,
    payload: serde_json::Value,
    process_after: DateTime<Utc>,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
    failed_count: i32,
    last_error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            tenant_id: row.try_get("tenant_id")?,
            payload: row.try_get("payload")?,
            process_after: row.try_get("process_after")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
            failed_count: row.try_get("failed_count")?,
            last_error: row.try_get("last_error")?,
            completed_at: row.try_get("completed_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn decode_tenant(operation: &str, raw: String) -> Result<TenantId, StoreError> {
    TenantId::new(raw).map_err(|e| StoreError::Decode {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

fn decode_job(operation: &str, row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    Ok(Job {
        id: JobId::from_uuid(row.id),
        queue_name: row.queue_name,
        tenant_id: decode_tenant(operation, row.tenant_id)?,
        payload: row.payload,
        process_after: row.process_after,
        claimed_by: row.claimed_by,
        claimed_until: row.claimed_until,
        failed_count: u32::try_from(row.failed_count).unwrap_or(0),
        last_error: row.last_error,
        completed_at: row.completed_at,
        dead_lettered_at: row.dead_lettered_at,
        created_at: row.created_at,
    })
}

struct TokenRow {
    id: uuid::Uuid,
    queue_name: String,
    tenant_id: String,
    leased_by: String,
    leased_until: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for TokenRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TokenRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            tenant_id: row.try_get("tenant_id")?,
            leased_by: row.try_get("leased_by")?,
            leased_until: row.try_get("leased_until")?,
        })
    }
}

impl TokenRow {
    fn into_token(self, operation: &str) -> Result<Token, StoreError> {
        Ok(Token {
            id: TokenId::from_uuid(self.id),
            queue_name: self.queue_name,
            tenant_id: decode_tenant(operation, self.tenant_id)?,
            leased_by: self.leased_by,
            leased_until: self.leased_until,
        })
    }
}
