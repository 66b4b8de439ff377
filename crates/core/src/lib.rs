//! `lattice-core`: primitives shared by the job queue and listener layers.
//!
//! This crate contains **pure** building blocks (no runtime, no storage).

pub mod backoff;
pub mod error;
pub mod id;

pub use backoff::{MAX_BACKOFF_MS, calculate_backoff, calculate_backoff_ms};
pub use error::DomainError;
pub use id::{JobId, ListenerId, TenantId, TokenId};
