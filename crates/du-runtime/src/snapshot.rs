//! The published usage snapshot and its atomic swap point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use du_core::types::UsageRecord;

/// One complete, immutable view of per-owner usage.
///
/// Readers hold an `Arc` to a snapshot for as long as they like; a newer publication never
/// mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub records: HashMap<String, UsageRecord>,
    /// 0 for the empty snapshot that exists before the first publication.
    pub generation: u64,
    pub manifest_key: Option<String>,
    pub built_at_unix_ms: u64,
    pub files_included: u64,
    pub files_failed: u64,
}

impl UsageSnapshot {
    pub fn get(&self, owner: &str) -> Option<&UsageRecord> {
        self.records.get(owner)
    }

    pub fn owners(&self) -> usize {
        self.records.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.size_bytes))
    }
}

pub struct SnapshotPublisher {
    current: ArcSwap<UsageSnapshot>,
    generation: AtomicU64,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(UsageSnapshot::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Stamps `snapshot` with the next generation and makes it visible to readers.
    pub fn publish(&self, mut snapshot: UsageSnapshot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        snapshot.generation = generation;
        self.current.store(Arc::new(snapshot));
        generation
    }

    pub fn current(&self) -> Arc<UsageSnapshot> {
        self.current.load_full()
    }

    pub fn lookup(&self, owner: &str) -> Option<UsageRecord> {
        self.current.load().get(owner).cloned()
    }

    pub fn has_published(&self) -> bool {
        self.generation.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cur = self.current.load();
        f.debug_struct("SnapshotPublisher")
            .field("generation", &cur.generation)
            .field("owners", &cur.owners())
            .finish()
    }
}
