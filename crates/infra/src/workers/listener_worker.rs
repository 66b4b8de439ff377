use std::sync::Arc;

use tracing::{debug, warn};

use lattice_core::ListenerId;
use lattice_events::{EventListener, ProcessOutcome};

use crate::config::DebounceConfig;
use crate::cursor_lock::{CursorLock, CursorStore, RunOutcome};
use crate::debounce::Debouncer;

/// Drives one listener: debounced wake-ups, each running `process_events`
/// under the listener's cursor lock.
///
/// - `handle()` is fire-and-forget and safe to call from any event source
/// - bursts of wake-ups collapse into one batch; batches never overlap
/// - only one instance across the fleet runs a batch per lock window
#[derive(Debug)]
pub struct ListenerWorker {
    listener_id: ListenerId,
    debouncer: Debouncer,
}

impl ListenerWorker {
    pub fn spawn<L, C>(listener: Arc<L>, lock: Arc<CursorLock<C>>, debounce: DebounceConfig) -> Self
    where
        L: EventListener,
        C: CursorStore,
    {
        let listener_id = listener.listener_id().clone();
        let debouncer = Debouncer::spawn(debounce, move || {
            let listener = listener.clone();
            let lock = lock.clone();
            async move {
                let outcome = lock.run(|cursor| listener.process_events(cursor)).await;
                log_outcome(listener.listener_id(), &outcome);
            }
        });

        Self {
            listener_id,
            debouncer,
        }
    }

    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    /// Signal that new events may be available.
    pub fn handle(&self) {
        self.debouncer.trigger();
    }

    /// Stop reacting to `handle()`. A batch already running finishes first.
    pub async fn shutdown(self) {
        self.debouncer.cancel();
        self.debouncer.shutdown().await;
    }
}

fn log_outcome(listener_id: &ListenerId, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped => debug!(listener_id = %listener_id, "batch skipped; lock held elsewhere"),
        RunOutcome::AcquireFailed => {
            warn!(listener_id = %listener_id, "batch not run; cursor lock unavailable")
        }
        RunOutcome::Completed(ProcessOutcome::Error { new_cursor, error }) => warn!(
            listener_id = %listener_id,
            new_cursor = ?new_cursor,
            error = %error,
            "listener batch failed"
        ),
        RunOutcome::Completed(outcome) => debug!(
            listener_id = %listener_id,
            status = ?outcome.status(),
            new_cursor = ?outcome.new_cursor(),
            "listener batch finished"
        ),
    }
}
