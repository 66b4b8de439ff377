use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lattice_core::ListenerId;

use crate::EventCursor;

/// Coarse status of a batch, as reported to the cursor lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NoEvents,
    Processed,
    Error,
}

/// Result of one `process_events` invocation.
///
/// `new_cursor` is the watermark reached by this batch, if any. On `Error` it
/// still carries the last event that was fully processed, so partial progress
/// is persisted rather than redone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    NoEvents,
    Processed {
        new_cursor: Option<EventCursor>,
    },
    Error {
        new_cursor: Option<EventCursor>,
        error: String,
    },
}

impl ProcessOutcome {
    pub fn processed(new_cursor: EventCursor) -> Self {
        Self::Processed {
            new_cursor: Some(new_cursor),
        }
    }

    pub fn error(new_cursor: Option<EventCursor>, error: impl Into<String>) -> Self {
        Self::Error {
            new_cursor,
            error: error.into(),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        match self {
            ProcessOutcome::NoEvents => ProcessStatus::NoEvents,
            ProcessOutcome::Processed { .. } => ProcessStatus::Processed,
            ProcessOutcome::Error { .. } => ProcessStatus::Error,
        }
    }

    /// Watermark to persist when the batch ends, regardless of status.
    pub fn new_cursor(&self) -> Option<EventCursor> {
        match self {
            ProcessOutcome::NoEvents => None,
            ProcessOutcome::Processed { new_cursor } | ProcessOutcome::Error { new_cursor, .. } => {
                *new_cursor
            }
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProcessOutcome::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// A logical consumer of the ordered event log.
///
/// Implementations must be idempotent: a batch can be re-run after a crash
/// between doing work and persisting the cursor.
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// Stable id; keys the persisted cursor and lock.
    fn listener_id(&self) -> &ListenerId;

    /// Process events strictly after `cursor` and report how far it got.
    async fn process_events(&self, cursor: EventCursor) -> ProcessOutcome;
}
