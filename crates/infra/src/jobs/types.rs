//! Core job and token types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lattice_core::{JobId, TenantId, TokenId};

/// Lifecycle state of a job, derived from its timestamps at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `process_after`; not claimable yet.
    Delayed,
    /// Claimable right now.
    Claimable,
    /// Held by a worker until `claimed_until`.
    Claimed,
    /// Completed successfully (terminal).
    Completed,
    /// Permanently failed (terminal).
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

/// A durable job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Logical job type; selects the handler.
    pub queue_name: String,
    /// Fairness partition key, extracted from the payload on send.
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    /// Not claimable before this instant (delay and backoff).
    pub process_after: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub failed_count: u32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        if self.completed_at.is_some() {
            JobState::Completed
        } else if self.dead_lettered_at.is_some() {
            JobState::DeadLettered
        } else if self.claimed_until.is_some_and(|until| until >= now) {
            JobState::Claimed
        } else if self.process_after > now {
            JobState::Delayed
        } else {
            JobState::Claimable
        }
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == JobState::Claimable
    }
}

/// A job about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub queue_name: String,
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    pub process_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(
        queue_name: impl Into<String>,
        tenant_id: TenantId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            tenant_id,
            payload,
            process_after: now,
            created_at: now,
        }
    }

    pub fn process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = at;
        self
    }
}

/// The exclusive right to drain jobs of one `(queue, tenant)` pair until `leased_until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub queue_name: String,
    pub tenant_id: TenantId,
    pub leased_by: String,
    pub leased_until: DateTime<Utc>,
}

/// Parameters of a batch token lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub leased_by: String,
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    pub limit: usize,
}

/// Parameters of a batch job claim for one token's pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub queue_name: String,
    pub tenant_id: TenantId,
    pub claimed_by: String,
    pub now: DateTime<Utc>,
    pub claimed_until: DateTime<Utc>,
    pub limit: usize,
}

impl ClaimRequest {
    pub fn for_token(
        token: &Token,
        claimed_by: impl Into<String>,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        limit: usize,
    ) -> Self {
        Self {
            queue_name: token.queue_name.clone(),
            tenant_id: token.tenant_id.clone(),
            claimed_by: claimed_by.into(),
            now,
            claimed_until,
            limit,
        }
    }
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Claimable or delayed.
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}
