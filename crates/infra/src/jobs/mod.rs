//! Database-backed job queue with tenant fairness, retry and dead-lettering.
//!
//! ## Design
//!
//! - Jobs are partitioned by `(queue_name, tenant_id)`; a worker must lease
//!   the pair's token before claiming its jobs, so one busy tenant cannot
//!   starve the others
//! - Tokens and job claims are time-bounded leases, never held connections
//! - Failures retry with exponential backoff until `max_retries`, then the
//!   job is dead-lettered with its last error
//!
//! ## Components
//!
//! - `TokenPool` / `JobStore`: persistence traits (Postgres and in-memory)
//! - `Ticker`: interval driver with a cap on overlapping ticks
//! - `QueueManager`: the orchestrator
//! - `JobHandler`: per-queue processing contract

pub mod handler;
pub mod manager;
pub mod postgres;
pub mod store;
pub mod ticker;
pub mod types;

pub use handler::{JobContext, JobHandler};
pub use manager::{
    HANDLER_PANICKED_ERROR, NO_HANDLER_ERROR, QueueError, QueueManager, SendOptions,
};
pub use postgres::PostgresQueueStore;
pub use store::{InMemoryQueueStore, JobStore, QueueStore, TokenPool};
pub use ticker::Ticker;
pub use types::{ClaimRequest, Job, JobState, LeaseRequest, NewJob, QueueStats, Token};
