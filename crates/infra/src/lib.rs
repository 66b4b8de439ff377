//! Infrastructure layer: persistence, job queue, cursor lock and workers.

pub mod clock;
pub mod config;
pub mod cursor_lock;
pub mod db;
pub mod debounce;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod workers;

mod integration_tests;

pub use clock::{Clock, SharedClock, SystemClock, TokioClock};
pub use config::{ConfigError, CursorLockConfig, DebounceConfig, QueueConfig};
pub use cursor_lock::{CursorLock, CursorLockError, CursorStore, RunOutcome};
pub use debounce::Debouncer;
pub use error::StoreError;
pub use jobs::{JobContext, JobHandler, QueueError, QueueManager, SendOptions};
pub use workers::ListenerWorker;
