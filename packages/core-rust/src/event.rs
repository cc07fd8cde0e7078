//! Observer notifications emitted by the engine.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Why a queue was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlushReason {
    /// The queue's cadence timer fired.
    Scheduled,
    /// The queue reached its maximum batch size.
    Backpressure,
    /// A caller asked for an immediate flush.
    Explicit,
    /// Final drain during shutdown.
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Scheduled => "scheduled",
            FlushReason::Backpressure => "backpressure",
            FlushReason::Explicit => "explicit",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// Event published once per processed batch and once per batch-level
/// backend failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    BatchProcessed {
        backend: &'static str,
        kind: &'static str,
        operation_count: usize,
        failed_count: usize,
        processing_time_us: u64,
        reason: FlushReason,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    BackendFailure {
        backend: &'static str,
        kind: &'static str,
        message: String,
        operation_count: usize,
        timestamp_ms: u64,
    },
}

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_event_serializes_camel_case() {
        let event = EngineEvent::BatchProcessed {
            backend: "cache",
            kind: "set",
            operation_count: 3,
            failed_count: 0,
            processing_time_us: 120,
            reason: FlushReason::Backpressure,
            timestamp_ms: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "batchProcessed");
        assert_eq!(json["operationCount"], 3);
        assert_eq!(json["reason"], "backpressure");
    }
}
