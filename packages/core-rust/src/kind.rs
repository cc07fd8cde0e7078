//! Operation kinds and the cadence classes that schedule them.
//!
//! Every backend variant owns a closed enum of the operations it accepts.
//! The engine never branches on strings: each kind knows its stable name,
//! its dense index (used to address per-kind queues and counters) and the
//! cadence class whose timer drains it.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Scheduling class of a queue.
///
/// Reads are latency-sensitive and drained on the fast timer; writes and
/// deletes are amortized on the slow timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cadence {
    /// Drained on every fast-timer tick.
    Fast,
    /// Drained on every slow-timer tick.
    Slow,
}

impl Cadence {
    /// Both cadence classes, fast first.
    pub const ALL: [Cadence; 2] = [Cadence::Fast, Cadence::Slow];

    /// Stable lowercase name used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Fast => "fast",
            Cadence::Slow => "slow",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed set of operation kinds for one backend variant.
pub trait OperationKind:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Every kind of this backend, ordered by [`index`](OperationKind::index).
    fn all() -> &'static [Self];

    /// Dense index in `0..all().len()`.
    fn index(self) -> usize;

    /// Stable lowercase name used in logs and metric labels.
    fn as_str(self) -> &'static str;

    /// Which timer drains queues of this kind.
    fn cadence(self) -> Cadence;
}

/// Operations accepted by the key-value cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheKind {
    Get,
    Set,
    Delete,
}

impl OperationKind for CacheKind {
    fn all() -> &'static [Self] {
        &[CacheKind::Get, CacheKind::Set, CacheKind::Delete]
    }

    fn index(self) -> usize {
        self as usize
    }

    fn as_str(self) -> &'static str {
        match self {
            CacheKind::Get => "get",
            CacheKind::Set => "set",
            CacheKind::Delete => "delete",
        }
    }

    fn cadence(self) -> Cadence {
        match self {
            CacheKind::Get => Cadence::Fast,
            CacheKind::Set | CacheKind::Delete => Cadence::Slow,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations accepted by the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentKind {
    Insert,
    Update,
    Select,
    Delete,
}

impl OperationKind for DocumentKind {
    fn all() -> &'static [Self] {
        &[
            DocumentKind::Insert,
            DocumentKind::Update,
            DocumentKind::Select,
            DocumentKind::Delete,
        ]
    }

    fn index(self) -> usize {
        self as usize
    }

    fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Insert => "insert",
            DocumentKind::Update => "update",
            DocumentKind::Select => "select",
            DocumentKind::Delete => "delete",
        }
    }

    fn cadence(self) -> Cadence {
        match self {
            DocumentKind::Select => Cadence::Fast,
            DocumentKind::Insert | DocumentKind::Update | DocumentKind::Delete => Cadence::Slow,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_dense<K: OperationKind>() {
        for (i, kind) in K::all().iter().enumerate() {
            assert_eq!(kind.index(), i, "{kind} is not at its own index");
        }
    }

    #[test]
    fn indexes_are_dense() {
        assert_dense::<CacheKind>();
        assert_dense::<DocumentKind>();
    }

    #[test]
    fn reads_are_fast_and_writes_are_slow() {
        assert_eq!(CacheKind::Get.cadence(), Cadence::Fast);
        assert_eq!(CacheKind::Set.cadence(), Cadence::Slow);
        assert_eq!(CacheKind::Delete.cadence(), Cadence::Slow);
        assert_eq!(DocumentKind::Select.cadence(), Cadence::Fast);
        assert_eq!(DocumentKind::Insert.cadence(), Cadence::Slow);
        assert_eq!(DocumentKind::Update.cadence(), Cadence::Slow);
        assert_eq!(DocumentKind::Delete.cadence(), Cadence::Slow);
    }

    #[test]
    fn names_are_lowercase() {
        assert_eq!(DocumentKind::Select.to_string(), "select");
        assert_eq!(CacheKind::Delete.to_string(), "delete");
        assert_eq!(Cadence::Slow.to_string(), "slow");
    }
}
