//! Listener cursor persistence with a time-bounded lock per listener.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lattice_core::ListenerId;
use lattice_events::EventCursor;

use crate::error::StoreError;

/// Cursor row storage.
///
/// Every mutation is a compare-and-swap on `locked_by`: only the current
/// holder may renew, release or advance the cursor.
#[async_trait]
pub trait CursorStore: Send + Sync + 'static {
    /// Create the listener's row if it does not exist. Existing rows are untouched.
    async fn ensure_listener(
        &self,
        listener_id: &ListenerId,
        initial: EventCursor,
    ) -> Result<(), StoreError>;

    /// Take the lock if it is free, expired, or already held by `locked_by`.
    /// Returns the stored cursor on success and `None` when another holder's
    /// lock is live (or the listener is unknown).
    async fn try_acquire(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<EventCursor>, StoreError>;

    /// Extend the lock. `false` when `locked_by` no longer holds it.
    async fn renew(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release the lock, first advancing the cursor to `new_cursor` if it is
    /// ahead of the stored one. `false` when `locked_by` no longer holds it,
    /// in which case nothing is written.
    async fn release(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        new_cursor: Option<EventCursor>,
    ) -> Result<bool, StoreError>;

    async fn get_cursor(&self, listener_id: &ListenerId)
    -> Result<Option<EventCursor>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CursorRow {
    cursor: EventCursor,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
}

/// In-memory cursor store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    rows: Mutex<HashMap<ListenerId, CursorRow>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any (expired or not).
    pub fn holder(&self, listener_id: &ListenerId) -> Result<Option<String>, StoreError> {
        let rows = self.rows.lock()?;
        Ok(rows.get(listener_id).and_then(|r| r.locked_by.clone()))
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn ensure_listener(
        &self,
        listener_id: &ListenerId,
        initial: EventCursor,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock()?;
        rows.entry(listener_id.clone()).or_insert(CursorRow {
            cursor: initial,
            locked_by: None,
            locked_until: None,
        });
        Ok(())
    }

    async fn try_acquire(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<EventCursor>, StoreError> {
        let mut rows = self.rows.lock()?;
        let Some(row) = rows.get_mut(listener_id) else {
            return Ok(None);
        };

        let free = row.locked_until.is_none_or(|until| until < now)
            || row.locked_by.as_deref() == Some(locked_by);
        if !free {
            return Ok(None);
        }

        row.locked_by = Some(locked_by.to_string());
        row.locked_until = Some(locked_until);
        Ok(Some(row.cursor))
    }

    async fn renew(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock()?;
        match rows
            .get_mut(listener_id)
            .filter(|r| r.locked_by.as_deref() == Some(locked_by))
        {
            Some(row) => {
                row.locked_until = Some(locked_until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(
        &self,
        listener_id: &ListenerId,
        locked_by: &str,
        new_cursor: Option<EventCursor>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock()?;
        match rows
            .get_mut(listener_id)
            .filter(|r| r.locked_by.as_deref() == Some(locked_by))
        {
            Some(row) => {
                if let Some(cursor) = new_cursor {
                    row.cursor = row.cursor.advance_to(cursor);
                }
                row.locked_by = None;
                row.locked_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_cursor(
        &self,
        listener_id: &ListenerId,
    ) -> Result<Option<EventCursor>, StoreError> {
        Ok(self.rows.lock()?.get(listener_id).map(|r| r.cursor))
    }
}
