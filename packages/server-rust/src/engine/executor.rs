//! Batch executor: dispatches drained batches and settles every record.
//!
//! Each queue has its own executor task reading batches from an unbounded
//! channel, so batches of one queue run strictly one after another while
//! different queues dispatch concurrently. After every batch the metrics
//! registry is updated and a [`EngineEvent::BatchProcessed`] is published.

use std::sync::Arc;
use std::time::Instant;

use opbatch_core::event::now_millis;
use opbatch_core::{EngineEvent, OperationError, OperationKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use super::completion::Completion;
use super::lane::Batch;
use super::metrics::MetricsRegistry;
use crate::backend::{BackendAdapter, CommandFailure, CommandOutcome, KindOf};

pub(crate) struct Executor<A: BackendAdapter> {
    adapter: Arc<A>,
    metrics: Arc<MetricsRegistry<KindOf<A>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl<A: BackendAdapter> Executor<A> {
    pub fn new(
        adapter: Arc<A>,
        metrics: Arc<MetricsRegistry<KindOf<A>>>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            adapter,
            metrics,
            events,
        }
    }

    /// Executes batches of one queue until its lane is closed.
    pub async fn run_lane(
        self: Arc<Self>,
        kind: KindOf<A>,
        mut rx: mpsc::UnboundedReceiver<Batch<A>>,
    ) {
        while let Some(batch) = rx.recv().await {
            self.execute(kind, batch).await;
        }
        debug!(backend = self.adapter.name(), kind = kind.as_str(), "executor finished");
    }

    async fn execute(&self, kind: KindOf<A>, batch: Batch<A>) {
        let Batch {
            records,
            reason,
            barrier,
        } = batch;

        if !records.is_empty() {
            let backend = self.adapter.name();
            let size = records.len();
            let started = Instant::now();
            let oldest_wait_ms = records
                .first()
                .map_or(0, |r| started.duration_since(r.enqueued_at).as_millis());

            let (entries, completions): (Vec<_>, Vec<_>) = records
                .into_iter()
                .map(|r| (r.entry, r.completion))
                .unzip();

            let failed = match self.adapter.dispatch(kind, &entries).await {
                Ok(outcomes) => settle(kind, completions, outcomes),
                Err(err) => {
                    let message = err.to_string();
                    error!(
                        backend,
                        kind = kind.as_str(),
                        size,
                        error = %message,
                        "batch dispatch failed"
                    );
                    let _ = self.events.send(EngineEvent::BackendFailure {
                        backend,
                        kind: kind.as_str(),
                        message,
                        operation_count: size,
                        timestamp_ms: now_millis(),
                    });
                    let err = Arc::new(err);
                    for completion in completions {
                        completion.reject(OperationError::Batch(Arc::clone(&err)));
                    }
                    size
                }
            };

            let elapsed = started.elapsed();
            self.metrics.record_batch(kind, size, failed, elapsed);
            debug!(
                backend,
                kind = kind.as_str(),
                size,
                failed,
                reason = reason.as_str(),
                elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                oldest_wait_ms = u64::try_from(oldest_wait_ms).unwrap_or(u64::MAX),
                "batch processed"
            );
            let _ = self.events.send(EngineEvent::BatchProcessed {
                backend,
                kind: kind.as_str(),
                operation_count: size,
                failed_count: failed,
                processing_time_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                reason,
                timestamp_ms: now_millis(),
            });
        }

        if let Some(barrier) = barrier {
            let _ = barrier.send(());
        }
    }
}

/// Matches outcomes to completions by position. Returns the number rejected.
fn settle<K: OperationKind, T>(
    kind: K,
    completions: Vec<Completion<T>>,
    outcomes: Vec<CommandOutcome<T>>,
) -> usize {
    let expected = completions.len();
    let returned = outcomes.len();
    if returned != expected {
        warn!(kind = kind.as_str(), expected, returned, "backend result count mismatch");
    }

    let mut failed = 0;
    let mut outcomes = outcomes.into_iter();
    for completion in completions {
        match outcomes.next() {
            Some(Ok(reply)) => completion.resolve(reply),
            Some(Err(CommandFailure::Command(message))) => {
                failed += 1;
                debug!(kind = kind.as_str(), error = %message, "command rejected");
                completion.reject(OperationError::Command {
                    kind: kind.as_str(),
                    message,
                });
            }
            Some(Err(CommandFailure::Backend(err))) => {
                failed += 1;
                completion.reject(OperationError::Batch(err));
            }
            None => {
                failed += 1;
                completion.reject(OperationError::MissingResult);
            }
        }
    }
    if failed > 0 {
        warn!(kind = kind.as_str(), failed, total = expected, "batch completed with failures");
    }
    failed
}

#[cfg(test)]
mod tests {
    use opbatch_core::{BackendError, CacheKind};

    use super::*;

    #[tokio::test]
    async fn settle_matches_by_position() {
        let (c1, p1) = Completion::<u32>::new();
        let (c2, p2) = Completion::<u32>::new();
        let (c3, p3) = Completion::<u32>::new();
        let shared = Arc::new(BackendError::Connection("gone".into()));

        let failed = settle(
            CacheKind::Set,
            vec![c1, c2, c3],
            vec![
                Ok(10),
                Err(CommandFailure::Command("bad key".into())),
                Err(CommandFailure::Backend(shared)),
            ],
        );

        assert_eq!(failed, 2);
        assert_eq!(p1.await.unwrap(), 10);
        match p2.await {
            Err(OperationError::Command { kind, message }) => {
                assert_eq!(kind, "set");
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(p3.await.unwrap_err().is_batch_failure());
    }

    #[tokio::test]
    async fn missing_outcomes_are_rejected() {
        let (c1, p1) = Completion::<u32>::new();
        let (c2, p2) = Completion::<u32>::new();

        let failed = settle(CacheKind::Get, vec![c1, c2], vec![Ok(1)]);

        assert_eq!(failed, 1);
        assert_eq!(p1.await.unwrap(), 1);
        assert!(matches!(p2.await, Err(OperationError::MissingResult)));
    }

    #[tokio::test]
    async fn surplus_outcomes_are_ignored() {
        let (c1, p1) = Completion::<u32>::new();
        let failed = settle(CacheKind::Get, vec![c1], vec![Ok(1), Ok(2)]);
        assert_eq!(failed, 0);
        assert_eq!(p1.await.unwrap(), 1);
    }
}
