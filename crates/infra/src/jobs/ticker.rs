//! Interval driver with bounded in-flight callbacks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// Fires a callback every `interval`.
///
/// At most `max_concurrency` callbacks run at once. When the cap is reached
/// the tick is skipped, not queued.
#[derive(Debug)]
pub struct Ticker {
    cancel: CancellationToken,
    tracker: TaskTracker,
    skipped: Arc<AtomicU64>,
}

impl Ticker {
    /// Start firing. The first tick happens one `interval` from now.
    pub fn start<F, Fut>(interval: Duration, max_concurrency: usize, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: TickFn = Arc::new(move || Box::pin(callback()) as TickFuture);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let skipped = Arc::new(AtomicU64::new(0));
        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));

        let stop = cancel.clone();
        let spawner = tracker.clone();
        let skipped_count = skipped.clone();
        tracker.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    skipped_count.fetch_add(1, Ordering::Relaxed);
                    debug!("tick skipped: max concurrency reached");
                    continue;
                };

                let callback = callback.clone();
                spawner.spawn(async move {
                    let _permit = permit;
                    callback().await;
                });
            }
        });

        Self {
            cancel,
            tracker,
            skipped,
        }
    }

    /// Halt future ticks. In-flight callbacks keep running.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once every in-flight callback has finished. Call after [`stop`](Self::stop).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Ticks skipped because the concurrency cap was reached.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
