//! Configuration for the queue, cursor lock and debouncer.
//!
//! Every struct carries production defaults via `Default`, deserializes from
//! a larger config document, and can be read from `LATTICE_*` environment
//! variables with `from_env()`.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration loading/validation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_millis_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_or(key, default_ms).map(Duration::from_millis)
}

/// Longest interval, lease or timeout any timer in this crate accepts.
pub const MAX_TIMER_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

fn check_timer(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_TIMER_DURATION {
        return Err(ConfigError::invalid(key, "must not exceed 24h"));
    }
    Ok(())
}

pub(crate) fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often the interval driver fires a tick.
    #[serde(rename = "poll_interval_ms", deserialize_with = "millis::deserialize")]
    pub poll_interval: Duration,
    /// Ticks allowed in flight at once; further ticks are skipped.
    pub max_concurrent_ticks: usize,
    /// Tokens leased per tick.
    pub token_batch_size: usize,
    /// Jobs claimed per token.
    pub claim_batch_size: usize,
    /// Jobs of one claimed batch processed simultaneously.
    pub processing_concurrency: usize,
    /// Lifetime of a token lease and of a job claim.
    #[serde(rename = "lock_duration_ms", deserialize_with = "millis::deserialize")]
    pub lock_duration: Duration,
    /// Cadence of batch claim renewal.
    #[serde(rename = "refresh_interval_ms", deserialize_with = "millis::deserialize")]
    pub refresh_interval: Duration,
    /// Failures after which a job is dead-lettered.
    pub max_retries: u32,
    #[serde(rename = "base_backoff_ms", deserialize_with = "millis::deserialize")]
    pub base_backoff: Duration,
    /// Upper bound on waiting for ticks and workers during `stop()`.
    #[serde(rename = "shutdown_timeout_ms", deserialize_with = "millis::deserialize")]
    pub shutdown_timeout: Duration,
    /// Payload field carrying the tenant id.
    pub tenant_field: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_concurrent_ticks: 3,
            token_batch_size: 10,
            claim_batch_size: 10,
            processing_concurrency: 3,
            lock_duration: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            tenant_field: "tenantId".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            poll_interval: env_millis_or("LATTICE_QUEUE_POLL_INTERVAL_MS", d.poll_interval)?,
            max_concurrent_ticks: env_or(
                "LATTICE_QUEUE_MAX_CONCURRENT_TICKS",
                d.max_concurrent_ticks,
            )?,
            token_batch_size: env_or("LATTICE_QUEUE_TOKEN_BATCH_SIZE", d.token_batch_size)?,
            claim_batch_size: env_or("LATTICE_QUEUE_CLAIM_BATCH_SIZE", d.claim_batch_size)?,
            processing_concurrency: env_or(
                "LATTICE_QUEUE_PROCESSING_CONCURRENCY",
                d.processing_concurrency,
            )?,
            lock_duration: env_millis_or("LATTICE_QUEUE_LOCK_DURATION_MS", d.lock_duration)?,
            refresh_interval: env_millis_or(
                "LATTICE_QUEUE_REFRESH_INTERVAL_MS",
                d.refresh_interval,
            )?,
            max_retries: env_or("LATTICE_QUEUE_MAX_RETRIES", d.max_retries)?,
            base_backoff: env_millis_or("LATTICE_QUEUE_BASE_BACKOFF_MS", d.base_backoff)?,
            shutdown_timeout: env_millis_or(
                "LATTICE_QUEUE_SHUTDOWN_TIMEOUT_MS",
                d.shutdown_timeout,
            )?,
            tenant_field: env_or("LATTICE_QUEUE_TENANT_FIELD", d.tenant_field)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be > 0"));
        }
        for (key, value) in [
            ("poll_interval", self.poll_interval),
            ("lock_duration", self.lock_duration),
            ("refresh_interval", self.refresh_interval),
            ("base_backoff", self.base_backoff),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            check_timer(key, value)?;
        }
        for (key, value) in [
            ("max_concurrent_ticks", self.max_concurrent_ticks),
            ("token_batch_size", self.token_batch_size),
            ("claim_batch_size", self.claim_batch_size),
            ("processing_concurrency", self.processing_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be > 0"));
            }
        }
        if self.refresh_interval.is_zero() || self.refresh_interval >= self.lock_duration {
            return Err(ConfigError::invalid(
                "refresh_interval",
                "must be > 0 and shorter than lock_duration",
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be >= 1"));
        }
        if self.tenant_field.trim().is_empty() {
            return Err(ConfigError::invalid("tenant_field", "must not be empty"));
        }
        Ok(())
    }
}

/// Cursor lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CursorLockConfig {
    #[serde(rename = "lock_duration_ms", deserialize_with = "millis::deserialize")]
    pub lock_duration: Duration,
    #[serde(rename = "refresh_interval_ms", deserialize_with = "millis::deserialize")]
    pub refresh_interval: Duration,
    /// Acquisition attempts on store errors before giving up.
    pub max_retries: u32,
    #[serde(rename = "base_backoff_ms", deserialize_with = "millis::deserialize")]
    pub base_backoff: Duration,
}

impl Default for CursorLockConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl CursorLockConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            lock_duration: env_millis_or("LATTICE_CURSOR_LOCK_DURATION_MS", d.lock_duration)?,
            refresh_interval: env_millis_or(
                "LATTICE_CURSOR_REFRESH_INTERVAL_MS",
                d.refresh_interval,
            )?,
            max_retries: env_or("LATTICE_CURSOR_MAX_RETRIES", d.max_retries)?,
            base_backoff: env_millis_or("LATTICE_CURSOR_BASE_BACKOFF_MS", d.base_backoff)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_timer("lock_duration", self.lock_duration)?;
        check_timer("base_backoff", self.base_backoff)?;
        if self.refresh_interval.is_zero() || self.refresh_interval >= self.lock_duration {
            return Err(ConfigError::invalid(
                "refresh_interval",
                "must be > 0 and shorter than lock_duration",
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be >= 1"));
        }
        Ok(())
    }
}

/// Debounce-with-max-wait configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Quiet period after the last trigger.
    #[serde(rename = "debounce_ms", deserialize_with = "millis::deserialize")]
    pub debounce: Duration,
    /// Latest firing time, measured from the first trigger of a burst.
    #[serde(rename = "max_wait_ms", deserialize_with = "millis::deserialize")]
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            max_wait: Duration::from_millis(200),
        }
    }
}

impl DebounceConfig {
    pub fn new(debounce: Duration, max_wait: Duration) -> Self {
        Self { debounce, max_wait }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            debounce: env_millis_or("LATTICE_DEBOUNCE_MS", d.debounce)?,
            max_wait: env_millis_or("LATTICE_DEBOUNCE_MAX_WAIT_MS", d.max_wait)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_timer("max_wait", self.max_wait)?;
        if self.debounce > self.max_wait {
            return Err(ConfigError::invalid("debounce", "must not exceed max_wait"));
        }
        Ok(())
    }
}
