//! Debounce with a max-wait ceiling, serialized against re-entrancy.
//!
//! A burst of `trigger()` calls runs the callback once, `debounce` after the
//! last trigger or `max_wait` after the first one, whichever is earlier.
//! Executions never overlap: triggers that arrive while the callback runs
//! collapse into one immediate re-run after it finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::DebounceConfig;

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Callback = Arc<dyn Fn() -> CallbackFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Trigger,
    Cancel,
}

/// Handle to a debounced callback. Dropping it stops the debouncer.
#[derive(Debug)]
pub struct Debouncer {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(config: DebounceConfig, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move || Box::pin(callback()) as CallbackFuture);
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(config, callback, receiver, shutdown.clone()));
        Self {
            commands,
            shutdown,
            task: Some(task),
        }
    }

    /// Request an execution. Never blocks.
    pub fn trigger(&self) {
        let _ = self.commands.send(Command::Trigger);
    }

    /// Drop the pending burst and any re-run recorded during an execution.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Stop the debouncer. An execution already running is allowed to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start and latest trigger of the current burst.
#[derive(Debug, Clone, Copy)]
struct Burst {
    first: Instant,
    last: Instant,
}

impl Burst {
    /// `None` when neither bound is representable as an `Instant`.
    fn deadline(&self, config: &DebounceConfig) -> Option<Instant> {
        [
            self.last.checked_add(config.debounce),
            self.first.checked_add(config.max_wait),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

async fn run(
    config: DebounceConfig,
    callback: Callback,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut burst: Option<Burst> = None;

    loop {
        let deadline = burst.and_then(|b| b.deadline(&config));
        let wait = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Trigger) => {
                    let now = Instant::now();
                    burst = Some(match burst {
                        Some(b) => Burst { first: b.first, last: now },
                        None => Burst { first: now, last: now },
                    });
                }
                Some(Command::Cancel) => burst = None,
                None => break,
            },
            _ = wait => {
                burst = None;
                execute_until_quiet(&callback, &mut commands, &shutdown).await;
            }
        }
    }
}

/// Run the callback, then once more if triggers arrived meanwhile.
async fn execute_until_quiet(
    callback: &Callback,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &CancellationToken,
) {
    loop {
        debug!("debounced callback firing");
        if let Err(e) = tokio::spawn(callback()).await {
            error!(error = %e, "debounced callback panicked");
        }

        let mut rerun = false;
        while let Ok(command) = commands.try_recv() {
            rerun = command == Command::Trigger;
        }
        if !rerun || shutdown.is_cancelled() {
            return;
        }
    }
}
