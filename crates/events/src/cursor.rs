use serde::{Deserialize, Serialize};

/// Watermark of the last event a listener has fully processed.
///
/// Event ids in the log are strictly increasing, so processing always resumes
/// strictly after the stored cursor. `EventCursor::START` means "nothing
/// processed yet".
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCursor(u64);

impl EventCursor {
    pub const START: EventCursor = EventCursor(0);

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn position(&self) -> u64 {
        self.0
    }

    /// The later of two watermarks. Cursors only ever move forward.
    pub fn advance_to(self, candidate: EventCursor) -> EventCursor {
        self.max(candidate)
    }
}

impl core::fmt::Display for EventCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventCursor {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
