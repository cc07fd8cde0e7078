//! Engine configuration: timer cadences, backpressure ceilings, metrics
//! collection and the document store readiness timeout.

use std::time::Duration;

use opbatch_core::Cadence;

/// Engine-level configuration for batching, scheduling and backpressure.
///
/// Controls both timer cadences, the per-class queue ceilings that trigger
/// out-of-cycle flushes, and whether metrics are collected.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval of the fast timer that drains read queues, in milliseconds.
    pub fast_interval_ms: u64,
    /// Interval of the slow timer that drains write and delete queues, in milliseconds.
    pub slow_interval_ms: u64,
    /// Queue length at which a read queue is flushed immediately.
    pub max_read_batch_size: usize,
    /// Queue length at which a write or delete queue is flushed immediately.
    pub max_write_batch_size: usize,
    /// Collect counters and mirror them to the `metrics` facade.
    pub metrics_enabled: bool,
    /// How long a document-store dispatch waits for the backend to report
    /// ready before the batch is rejected, in milliseconds.
    pub readiness_timeout_ms: u64,
    /// Capacity of the broadcast channel carrying engine events.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 10,
            slow_interval_ms: 50,
            max_read_batch_size: 100,
            max_write_batch_size: 500,
            metrics_enabled: true,
            readiness_timeout_ms: 5_000,
            event_channel_capacity: 1024,
        }
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid engine configuration: {field} must be greater than zero")]
pub struct ConfigError {
    pub field: &'static str,
}

impl EngineConfig {
    /// Checks that every interval, size and capacity is non-zero.
    ///
    /// # Errors
    ///
    /// Returns the first field found to be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("fast_interval_ms", self.fast_interval_ms == 0),
            ("slow_interval_ms", self.slow_interval_ms == 0),
            ("max_read_batch_size", self.max_read_batch_size == 0),
            ("max_write_batch_size", self.max_write_batch_size == 0),
            ("event_channel_capacity", self.event_channel_capacity == 0),
        ];
        match checks.into_iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError { field }),
            None => Ok(()),
        }
    }

    /// Timer period for a cadence class.
    #[must_use]
    pub fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Fast => Duration::from_millis(self.fast_interval_ms),
            Cadence::Slow => Duration::from_millis(self.slow_interval_ms),
        }
    }

    /// Backpressure ceiling for queues of a cadence class.
    #[must_use]
    pub fn max_batch_size(&self, cadence: Cadence) -> usize {
        match cadence {
            Cadence::Fast => self.max_read_batch_size,
            Cadence::Slow => self.max_write_batch_size,
        }
    }

    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}
