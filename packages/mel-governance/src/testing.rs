//! Testing utilities for governance tests.
//!
//! Enabled with the `testing` feature.

use std::sync::Mutex;

use crate::events::{EventSink, GovernanceEvent};

/// Records every emitted governance event for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GovernanceEvent>>,
}

impl RecordingSink {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<GovernanceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Count events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&GovernanceEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GovernanceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
