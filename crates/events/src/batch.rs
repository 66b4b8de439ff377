//! In-order batch processing with partial-progress reporting.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use lattice_core::TenantId;

use crate::{EventCursor, ProcessOutcome};

/// One entry of the append-only event log, as read by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Position in the log; strictly increasing.
    pub id: EventCursor,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: JsonValue,
}

/// Apply `apply` to every event after `cursor`, in increasing id order.
///
/// Stops at the first failure and reports the last event that succeeded as
/// the new cursor, so the caller persists partial progress.
pub async fn process_in_order<'a, F, Fut, E>(
    events: &'a [LoggedEvent],
    cursor: EventCursor,
    mut apply: F,
) -> ProcessOutcome
where
    F: FnMut(&'a LoggedEvent) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: core::fmt::Display,
{
    let mut pending: Vec<&'a LoggedEvent> = events.iter().filter(|e| e.id > cursor).collect();
    if pending.is_empty() {
        return ProcessOutcome::NoEvents;
    }
    pending.sort_by_key(|e| e.id);

    let mut reached: Option<EventCursor> = None;
    for event in pending {
        if let Err(err) = apply(event).await {
            return ProcessOutcome::error(
                reached,
                format!("event {} ({}) failed: {err}", event.id, event.event_type),
            );
        }
        reached = Some(event.id);
    }

    ProcessOutcome::Processed {
        new_cursor: reached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(id: u64) -> LoggedEvent {
        LoggedEvent {
            id: EventCursor::new(id),
            tenant_id: TenantId::new("ws1").unwrap(),
            event_type: "message_created".to_string(),
            payload: serde_json::json!({"n": id}),
        }
    }

    #[tokio::test]
    async fn skips_events_at_or_before_cursor_and_sorts() {
        let events = vec![event(5), event(2), event(4), event(3)];
        let seen = Mutex::new(Vec::new());

        let outcome = process_in_order(&events, EventCursor::new(2), |e| {
            seen.lock().unwrap().push(e.id.position());
            async { Ok::<(), String>(()) }
        })
        .await;

        assert_eq!(outcome, ProcessOutcome::processed(EventCursor::new(5)));
        assert_eq!(*seen.lock().unwrap(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn failure_reports_last_successful_event() {
        let events = vec![event(1), event(2), event(3)];

        let outcome = process_in_order(&events, EventCursor::START, |e| {
            let fail = e.id.position() == 3;
            async move { if fail { Err("boom") } else { Ok(()) } }
        })
        .await;

        assert_eq!(outcome.new_cursor(), Some(EventCursor::new(2)));
        assert!(outcome.error_message().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn failure_on_first_event_has_no_cursor() {
        let events = vec![event(9)];
        let outcome =
            process_in_order(&events, EventCursor::START, |_| async { Err::<(), _>("nope") }).await;
        assert_eq!(outcome.new_cursor(), None);
    }

    #[tokio::test]
    async fn nothing_after_cursor_is_no_events() {
        let events = vec![event(1)];
        let outcome =
            process_in_order(&events, EventCursor::new(1), |_| async { Ok::<(), String>(()) }).await;
        assert_eq!(outcome, ProcessOutcome::NoEvents);
    }
}
