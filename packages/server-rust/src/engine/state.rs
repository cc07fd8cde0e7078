//! Engine lifecycle state with single-winner shutdown.
//!
//! Uses `ArcSwap` for lock-free state reads on the enqueue path and a
//! `watch` channel so late shutdown callers can wait for the first one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

/// Engine lifecycle, transitioned by shutdown.
///
/// State machine: Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    /// Timers are running and operations are accepted.
    Running,
    /// Shutdown has begun: timers are cancelled, the final drain is in
    /// progress and new operations are refused.
    Draining,
    /// Every queue has settled and the backend connection is released.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ArcSwap<EngineState>,
    shutdown_claimed: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (stopped, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(EngineState::Running),
            shutdown_claimed: AtomicBool::new(false),
            stopped,
        }
    }

    pub fn state(&self) -> EngineState {
        **self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Moves to `Draining`. Returns `true` only for the first caller, who
    /// then owns the rest of the shutdown sequence.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutdown_claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(Arc::new(EngineState::Draining));
        true
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(EngineState::Stopped));
        self.stopped.send_replace(true);
    }

    /// Resolves once [`mark_stopped`](Self::mark_stopped) has run.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
