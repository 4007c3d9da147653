//! Structured dispatch events for injected observers
//!
//! Components never write to an output stream; state transitions, quota
//! exhaustion, and score updates are pushed to whatever observer the
//! embedding application wires in.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use super::circuit::CircuitState;

/// Sink for structured dispatch events
pub trait DispatchObserver: Send + Sync {
    fn on_event(&self, event: &DispatchEvent);
}

/// A structured event emitted by the dispatch core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DispatchEvent {
    /// A provider's circuit breaker changed state
    CircuitTransition {
        provider_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A provider consumed the last tokens of its quota window
    QuotaExhausted { provider_id: String, quota_limit: u64 },
    /// A provider's score moved after an outcome report
    ScoreUpdated {
        provider_id: String,
        tier: String,
        previous: f64,
        current: f64,
    },
    /// A best-effort snapshot write failed; in-memory state is unaffected
    SnapshotFailed { message: String },
}

/// In-memory observer that buffers events for later inspection
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<DispatchEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all buffered events, oldest first
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl DispatchObserver for EventLog {
    fn on_event(&self, event: &DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
