//! Short-horizon seen-set over stable item ids.
//!
//! Backed by a capacity- and TTL-bounded cache so memory stays flat and
//! entries past the horizon lapse without an explicit sweeper. Safe for
//! concurrent inserts from all collectors.

use crate::types::Item;
use moka::future::Cache;
use std::time::Duration;
use tracing::debug;

pub struct Deduplicator {
    seen: Cache<String, i64>,
    horizon: Duration,
}

impl Deduplicator {
    pub fn new(capacity: u64, horizon: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(horizon)
            .build();
        Self { seen, horizon }
    }

    /// Pre-load ids persisted by a previous run. Entries already past the
    /// horizon are the caller's job to exclude.
    pub async fn warm(&self, entries: Vec<(String, i64)>) {
        let count = entries.len();
        for (id, first_seen) in entries {
            self.seen.insert(id, first_seen).await;
        }
        debug!(count, "dedup index warmed from ledger");
    }

    /// Drop every item whose id was already observed within the horizon.
    /// Returns the surviving items and the (id, first_seen_ts) pairs that
    /// were newly recorded, for persistence.
    pub async fn filter_batch(&self, items: Vec<Item>, now: i64) -> (Vec<Item>, Vec<(String, i64)>) {
        let mut fresh = Vec::with_capacity(items.len());
        let mut recorded = Vec::new();
        for item in items {
            // entry().or_insert() is atomic, so two collectors racing on the
            // same id agree on exactly one winner.
            let entry = self.seen.entry(item.id.clone()).or_insert(now).await;
            if entry.is_fresh() {
                recorded.push((item.id.clone(), now));
                fresh.push(item);
            }
        }
        (fresh, recorded)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Approximate number of tracked ids.
    pub fn len(&self) -> u64 {
        self.seen.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
