//! Per-listener distributed lock plus persisted watermark.
//!
//! `CursorLock::run` executes a batch function at most once per contested
//! window across every running instance, without holding a database
//! connection for the duration of the batch: the lock is a time-bounded row
//! lease renewed in the background.

pub mod postgres;
pub mod store;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use lattice_core::{ListenerId, calculate_backoff};
use lattice_events::{EventCursor, ProcessOutcome};

use crate::clock::{SharedClock, add_duration, system_clock};
use crate::config::{ConfigError, CursorLockConfig};
use crate::error::StoreError;
use crate::lease::LeaseRenewer;

pub use postgres::PostgresCursorStore;
pub use store::{CursorStore, InMemoryCursorStore};

#[derive(Debug, Error)]
pub enum CursorLockError {
    #[error("invalid cursor lock configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to one `run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another holder's lock is live; the batch did not run.
    Skipped,
    /// The batch ran under the lock and its watermark was handed to the store.
    Completed(ProcessOutcome),
    /// Store errors exhausted the acquisition retries; the batch did not run.
    AcquireFailed,
}

enum Acquire {
    Acquired(EventCursor),
    Contended,
    Failed,
}

/// Lock + cursor for one listener.
pub struct CursorLock<C: CursorStore> {
    store: Arc<C>,
    listener_id: ListenerId,
    config: CursorLockConfig,
    clock: SharedClock,
    instance_id: String,
}

impl<C: CursorStore> core::fmt::Debug for CursorLock<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CursorLock")
            .field("listener_id", &self.listener_id)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl<C: CursorStore> CursorLock<C> {
    /// Create the listener's cursor row on first registration.
    pub async fn register(
        store: Arc<C>,
        listener_id: ListenerId,
        config: CursorLockConfig,
    ) -> Result<Self, CursorLockError> {
        Self::register_with_clock(store, listener_id, config, system_clock()).await
    }

    pub async fn register_with_clock(
        store: Arc<C>,
        listener_id: ListenerId,
        config: CursorLockConfig,
        clock: SharedClock,
    ) -> Result<Self, CursorLockError> {
        config.validate()?;
        store
            .ensure_listener(&listener_id, EventCursor::START)
            .await?;
        info!(listener_id = %listener_id, "listener registered");

        Ok(Self {
            store,
            listener_id,
            config,
            clock,
            instance_id: format!("instance-{}", uuid::Uuid::new_v4()),
        })
    }

    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    /// The persisted watermark.
    pub async fn cursor(&self) -> Result<EventCursor, CursorLockError> {
        Ok(self
            .store
            .get_cursor(&self.listener_id)
            .await?
            .unwrap_or(EventCursor::START))
    }

    /// Run `batch` under the lock, starting from the persisted cursor.
    ///
    /// The watermark in the returned outcome is persisted on every status,
    /// including `Error`, so partial progress survives a failing batch.
    pub async fn run<F, Fut>(&self, batch: F) -> RunOutcome
    where
        F: FnOnce(EventCursor) -> Fut,
        Fut: Future<Output = ProcessOutcome>,
    {
        let holder = format!("{}:{}", self.instance_id, uuid::Uuid::new_v4());

        let cursor = match self.acquire(&holder).await {
            Acquire::Acquired(cursor) => cursor,
            Acquire::Contended => {
                debug!(listener_id = %self.listener_id, "cursor lock held elsewhere; skipping");
                return RunOutcome::Skipped;
            }
            Acquire::Failed => return RunOutcome::AcquireFailed,
        };
        debug!(listener_id = %self.listener_id, %cursor, "cursor lock acquired");

        let renewer = self.spawn_renewer(holder.clone());
        let outcome = batch(cursor).await;
        renewer.stop().await;

        let new_cursor = outcome.new_cursor();
        match self
            .store
            .release(&self.listener_id, &holder, new_cursor)
            .await
        {
            Ok(true) => debug!(
                listener_id = %self.listener_id,
                status = ?outcome.status(),
                new_cursor = ?new_cursor,
                "cursor lock released"
            ),
            Ok(false) => warn!(
                listener_id = %self.listener_id,
                new_cursor = ?new_cursor,
                "cursor lock lost before release; progress not persisted"
            ),
            Err(e) => error!(
                listener_id = %self.listener_id,
                error = %e,
                "cursor lock release failed; lock will expire"
            ),
        }

        RunOutcome::Completed(outcome)
    }

    async fn acquire(&self, holder: &str) -> Acquire {
        let attempts = self.config.max_retries.max(1);
        for attempt in 0..attempts {
            let now = self.clock.now();
            let until = add_duration(now, self.config.lock_duration);
            match self
                .store
                .try_acquire(&self.listener_id, holder, now, until)
                .await
            {
                Ok(Some(cursor)) => return Acquire::Acquired(cursor),
                Ok(None) => return Acquire::Contended,
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let backoff = calculate_backoff(self.config.base_backoff, attempt);
                    warn!(
                        listener_id = %self.listener_id,
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "cursor lock acquisition failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        listener_id = %self.listener_id,
                        error = %e,
                        attempt = attempt + 1,
                        "cursor lock acquisition failed; giving up"
                    );
                    return Acquire::Failed;
                }
            }
        }
        Acquire::Failed
    }

    fn spawn_renewer(&self, holder: String) -> LeaseRenewer {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let listener_id = self.listener_id.clone();
        let lock_duration = self.config.lock_duration;

        LeaseRenewer::spawn(self.config.refresh_interval, move || {
            let store = store.clone();
            let listener_id = listener_id.clone();
            let holder = holder.clone();
            let until = add_duration(clock.now(), lock_duration);
            async move {
                match store.renew(&listener_id, &holder, until).await {
                    Ok(true) => debug!(listener_id = %listener_id, "cursor lock renewed"),
                    Ok(false) => warn!(listener_id = %listener_id, "cursor lock lost during batch"),
                    Err(e) => warn!(listener_id = %listener_id, error = %e, "cursor lock renewal failed"),
                }
            }
        })
    }
}
