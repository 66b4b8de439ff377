//! Retry backoff calculation.

use std::time::Duration;

/// Upper bound for any computed backoff (one hour).
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;

/// Delay before a job that has failed `retry_count` times becomes claimable again.
///
/// Exponential: `base_ms * 2^retry_count`, saturating and capped at
/// [`MAX_BACKOFF_MS`]. Deterministic and monotonically non-decreasing in
/// `retry_count`.
pub fn calculate_backoff_ms(base_ms: u64, retry_count: u32) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// [`calculate_backoff_ms`] for callers holding a `Duration`.
pub fn calculate_backoff(base: Duration, retry_count: u32) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(calculate_backoff_ms(base_ms, retry_count))
}
