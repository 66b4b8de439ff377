//! Long-running background workers.

pub mod listener_worker;

pub use listener_worker::ListenerWorker;
