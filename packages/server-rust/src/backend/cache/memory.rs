//! In-memory [`CacheStore`] backed by [`DashMap`].
//!
//! Honours per-key TTLs against tokio's clock, so paused-time tests can
//! expire entries by advancing time. Every pipeline call is recorded for
//! inspection, and round-trip failures, per-key command failures and
//! latency can be injected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opbatch_core::BackendError;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CacheCommand, CacheStore, CacheValue, CommandResult};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Pipelined key-value store living in process memory.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    pipelines: Mutex<Vec<Vec<CacheCommand>>>,
    faults: Mutex<VecDeque<BackendError>>,
    failing_keys: DashMap<String, String>,
    latency: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored text of a live key.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Every pipeline received so far, oldest first.
    #[must_use]
    pub fn pipelines(&self) -> Vec<Vec<CacheCommand>> {
        self.pipelines.lock().clone()
    }

    /// Fails the next pipeline round trip with `error`. Queued errors are
    /// consumed one per call.
    pub fn fail_next(&self, error: BackendError) {
        self.faults.lock().push_back(error);
    }

    /// Makes every command touching `key` fail with `message`.
    pub fn fail_key(&self, key: impl Into<String>, message: impl Into<String>) {
        self.failing_keys.insert(key.into(), message.into());
    }

    /// Delays every round trip by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_key(&self, key: &str) -> Result<(), String> {
        if key.is_empty() {
            return Err("empty key".to_string());
        }
        match self.failing_keys.get(key) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn read(&self, key: &str, now: Instant) -> CacheValue {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => CacheValue::Data(entry.value.clone()),
            _ => CacheValue::Nil,
        }
    }

    fn execute(&self, command: &CacheCommand, now: Instant) -> CommandResult {
        match command {
            CacheCommand::Get { key } => {
                self.check_key(key)?;
                Ok(self.read(key, now))
            }
            CacheCommand::MultiGet { keys } => {
                keys.iter().try_for_each(|key| self.check_key(key))?;
                Ok(CacheValue::Array(
                    keys.iter().map(|key| self.read(key, now)).collect(),
                ))
            }
            CacheCommand::Set { key, value, ttl } => {
                self.check_key(key)?;
                if ttl.is_some_and(|ttl| ttl.is_zero()) {
                    return Err("invalid expire time".to_string());
                }
                self.entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                Ok(CacheValue::Ok)
            }
            CacheCommand::Delete { key } => {
                self.check_key(key)?;
                let removed = self
                    .entries
                    .remove(key)
                    .is_some_and(|(_, entry)| entry.is_live(now));
                Ok(CacheValue::Int(i64::from(removed)))
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn pipeline(
        &self,
        commands: &[CacheCommand],
    ) -> Result<Vec<CommandResult>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.pipelines.lock().push(commands.to_vec());
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }

        let now = Instant::now();
        Ok(commands.iter().map(|c| self.execute(c, now)).collect())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str, ttl: Option<Duration>) -> CacheCommand {
        CacheCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }
    }

    #[tokio::test]
    async fn failing_command_leaves_siblings_alone() {
        let store = MemoryCacheStore::new();
        store.fail_key("bad", "WRONGTYPE");

        let results = store
            .pipeline(&[set("a", "1", None), set("bad", "2", None), set("", "3", None)])
            .await
            .unwrap();

        assert_eq!(results[0], Ok(CacheValue::Ok));
        assert_eq!(results[1], Err("WRONGTYPE".to_string()));
        assert_eq!(results[2], Err("empty key".to_string()));
        assert_eq!(store.raw("a").as_deref(), Some("1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryCacheStore::new();
        store
            .pipeline(&[set("s", "x", Some(Duration::from_secs(1)))])
            .await
            .unwrap();
        assert_eq!(store.raw("s").as_deref(), Some("x"));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(store.raw("s"), None);
        let results = store
            .pipeline(&[CacheCommand::Get { key: "s".into() }])
            .await
            .unwrap();
        assert_eq!(results[0], Ok(CacheValue::Nil));
    }

    #[tokio::test]
    async fn injected_fault_fails_one_round_trip() {
        let store = MemoryCacheStore::new();
        store.fail_next(BackendError::Connection("refused".into()));

        assert!(store.pipeline(&[set("a", "1", None)]).await.is_err());
        assert!(store.pipeline(&[set("a", "1", None)]).await.is_ok());
        assert_eq!(store.pipelines().len(), 2);
    }

    #[tokio::test]
    async fn closed_store_refuses_pipelines() {
        let store = MemoryCacheStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.pipeline(&[set("a", "1", None)]).await,
            Err(BackendError::Closed)
        ));
    }
}
