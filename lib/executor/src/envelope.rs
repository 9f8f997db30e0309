//! Versioned envelope for streamed run events.
//!
//! Every event leaving the engine is wrapped with a format version so that
//! SSE consumers can detect payloads they do not understand instead of
//! misreading them.

use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A payload with its format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload at the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionEvent;
    use blockflow_core::ExecutionId;

    #[test]
    fn event_envelope_carries_version_and_type() {
        let event = ExecutionEvent::run_started(ExecutionId::new());
        let json = serde_json::to_value(Envelope::new(event)).expect("serialize");

        assert_eq!(json["version"], CURRENT_VERSION);
        assert_eq!(json["payload"]["type"], "run_started");
    }

    #[test]
    fn envelope_from_another_version_still_parses() {
        let execution_id = ExecutionId::new();
        let mut json = serde_json::to_value(Envelope::new(ExecutionEvent::run_started(execution_id)))
            .expect("serialize");
        json["version"] = 2.into();

        let parsed: Envelope<ExecutionEvent> = serde_json::from_value(json).expect("parse");
        assert_ne!(parsed.version, CURRENT_VERSION);
        assert_eq!(parsed.payload().execution_id(), execution_id);
    }
}
