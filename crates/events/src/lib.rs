//! Listener contract for consumers of the append-only event log.
//!
//! A listener owns a persisted watermark (`EventCursor`) and an idempotent
//! `process_events` body. Exclusivity across running instances is provided by
//! the infra layer's cursor lock; this crate only defines the shapes.

pub mod batch;
pub mod cursor;
pub mod listener;

pub use batch::{LoggedEvent, process_in_order};
pub use cursor::EventCursor;
pub use listener::{EventListener, ProcessOutcome, ProcessStatus};
