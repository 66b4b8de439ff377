//! Token pool and job store abstractions, plus the in-memory backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lattice_core::{JobId, TenantId, TokenId};

use super::types::{ClaimRequest, Job, JobState, LeaseRequest, NewJob, QueueStats, Token};
use crate::error::StoreError;

/// Leases short-lived exclusivity tokens keyed by `(queue_name, tenant_id)`.
#[async_trait]
pub trait TokenPool: Send + Sync + 'static {
    /// Atomically lease up to `limit` pairs that have claimable work and no
    /// live token. Safe under concurrent callers: a pair is never returned
    /// to two leasers while the first lease is valid.
    async fn batch_lease_tokens(&self, request: &LeaseRequest) -> Result<Vec<Token>, StoreError>;

    /// Release a token. A no-op when the token already expired and was
    /// re-leased by someone else.
    async fn delete_token(&self, token_id: TokenId, leased_by: &str) -> Result<(), StoreError>;
}

/// Durable job rows.
///
/// Mutations of a claimed job (`complete`, `retry`, `dead_letter`) only apply
/// while `claimed_by` matches; they return `false` when the claim was lost.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Claim up to `limit` claimable jobs of one pair, oldest `process_after` first.
    async fn batch_claim_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>, StoreError>;

    /// Re-stamp `claimed_until` for a whole claimed batch in one operation.
    /// Returns the number of jobs still held by `claimed_by`.
    async fn batch_renew_claims(
        &self,
        job_ids: &[JobId],
        claimed_by: &str,
        claimed_until: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn complete_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a failure and make the job claimable again at `process_after`.
    async fn retry_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        process_after: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move the job to its terminal failure state.
    async fn dead_letter_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Dead-lettered jobs, oldest dead-letter first.
    async fn list_dead_letters(
        &self,
        queue_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Put a dead-lettered job back in the queue with a fresh retry budget.
    /// `last_error` is kept for history.
    async fn requeue_dead_letter(&self, job_id: JobId, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    async fn queue_stats(&self, queue_name: &str, now: DateTime<Utc>)
    -> Result<QueueStats, StoreError>;
}

/// Everything the queue manager needs from persistence.
pub trait QueueStore: JobStore + TokenPool {}

impl<T> QueueStore for T where T: JobStore + TokenPool {}

type PairKey = (String, TenantId);

/// In-memory queue store for tests/dev.
///
/// Mirrors the Postgres semantics: lease and claim checks compare against the
/// caller-supplied `now`, never the system clock.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    tokens: Mutex<HashMap<PairKey, Token>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job (tests and diagnostics).
    pub fn all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock()?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.id);
        Ok(all)
    }

    /// Tokens still valid at `now`.
    pub fn live_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Token>, StoreError> {
        let tokens = self.tokens.lock()?;
        Ok(tokens
            .values()
            .filter(|t| t.leased_until >= now)
            .cloned()
            .collect())
    }
}

fn held_by(job: &Job, claimed_by: &str) -> bool {
    job.claimed_by.as_deref() == Some(claimed_by)
        && job.completed_at.is_none()
        && job.dead_lettered_at.is_none()
}

#[async_trait]
impl TokenPool for InMemoryQueueStore {
    async fn batch_lease_tokens(&self, request: &LeaseRequest) -> Result<Vec<Token>, StoreError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let jobs = self.jobs.lock()?;
        let mut tokens = self.tokens.lock()?;

        // Oldest pending work first, so pairs take turns.
        let mut candidates: HashMap<PairKey, DateTime<Utc>> = HashMap::new();
        for job in jobs.values().filter(|j| j.is_claimable_at(request.now)) {
            let key = (job.queue_name.clone(), job.tenant_id.clone());
            candidates
                .entry(key)
                .and_modify(|oldest| *oldest = (*oldest).min(job.process_after))
                .or_insert(job.process_after);
        }

        let mut candidates: Vec<(PairKey, DateTime<Utc>)> = candidates
            .into_iter()
            .filter(|(key, _)| {
                tokens
                    .get(key)
                    .is_none_or(|t| t.leased_until < request.now)
            })
            .collect();
        candidates.sort_by(|(ka, ta), (kb, tb)| ta.cmp(tb).then_with(|| ka.cmp(kb)));

        let leased = candidates
            .into_iter()
            .take(request.limit)
            .map(|((queue_name, tenant_id), _)| {
                let token = Token {
                    id: TokenId::new(),
                    queue_name: queue_name.clone(),
                    tenant_id: tenant_id.clone(),
                    leased_by: request.leased_by.clone(),
                    leased_until: request.lease_until,
                };
                tokens.insert((queue_name, tenant_id), token.clone());
                token
            })
            .collect();

        Ok(leased)
    }

    async fn delete_token(&self, token_id: TokenId, leased_by: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock()?;
        tokens.retain(|_, t| !(t.id == token_id && t.leased_by == leased_by));
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryQueueStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.lock()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict {
                operation: "insert_job".to_string(),
                message: format!("job {} already exists", job.id),
            });
        }
        let id = job.id;
        jobs.insert(
            id,
            Job {
                id,
                queue_name: job.queue_name,
                tenant_id: job.tenant_id,
                payload: job.payload,
                process_after: job.process_after,
                claimed_by: None,
                claimed_until: None,
                failed_count: 0,
                last_error: None,
                completed_at: None,
                dead_lettered_at: None,
                created_at: job.created_at,
            },
        );
        Ok(id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock()?.get(&job_id).cloned())
    }

    async fn batch_claim_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.lock()?;

        let mut ids: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| {
                j.queue_name == request.queue_name
                    && j.tenant_id == request.tenant_id
                    && j.is_claimable_at(request.now)
            })
            .map(|j| (j.process_after, j.id))
            .collect();
        ids.sort();
        ids.truncate(request.limit);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.claimed_by = Some(request.claimed_by.clone());
                job.claimed_until = Some(request.claimed_until);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn batch_renew_claims(
        &self,
        job_ids: &[JobId],
        claimed_by: &str,
        claimed_until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock()?;
        let mut renewed = 0;
        for id in job_ids {
            if let Some(job) = jobs.get_mut(id).filter(|j| held_by(j, claimed_by)) {
                job.claimed_until = Some(claimed_until);
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock()?;
        match jobs.get_mut(&job_id).filter(|j| held_by(j, claimed_by)) {
            Some(job) => {
                job.completed_at = Some(now);
                job.claimed_by = None;
                job.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retry_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        process_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock()?;
        match jobs.get_mut(&job_id).filter(|j| held_by(j, claimed_by)) {
            Some(job) => {
                job.failed_count = failed_count;
                job.last_error = Some(error.to_string());
                job.process_after = process_after;
                job.claimed_by = None;
                job.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dead_letter_job(
        &self,
        job_id: JobId,
        claimed_by: &str,
        failed_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock()?;
        match jobs.get_mut(&job_id).filter(|j| held_by(j, claimed_by)) {
            Some(job) => {
                job.failed_count = failed_count;
                job.last_error = Some(error.to_string());
                job.dead_lettered_at = Some(now);
                job.claimed_by = None;
                job.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_dead_letters(
        &self,
        queue_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock()?;
        let mut dead: Vec<Job> = jobs
            .values()
            .filter(|j| j.dead_lettered_at.is_some())
            .filter(|j| queue_name.is_none_or(|q| j.queue_name == q))
            .cloned()
            .collect();
        dead.sort_by_key(|j| (j.dead_lettered_at, j.id));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock()?;
        match jobs.get_mut(&job_id).filter(|j| j.dead_lettered_at.is_some()) {
            Some(job) => {
                job.dead_lettered_at = None;
                job.failed_count = 0;
                job.process_after = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_stats(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, StoreError> {
        let jobs = self.jobs.lock()?;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.queue_name == queue_name) {
            match job.state_at(now) {
                JobState::Delayed | JobState::Claimable => stats.pending += 1,
                JobState::Claimed => stats.claimed += 1,
                JobState::Completed => stats.completed += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
