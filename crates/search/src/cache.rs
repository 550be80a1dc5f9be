//! Time-bounded result cache keyed by normalized query signature.

use std::sync::Arc;

use ordo_core::{Millis, OrderRecord};
use rustc_hash::FxHashMap;

use crate::SearchMeta;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Arc<Vec<OrderRecord>>,
    pub meta: SearchMeta,
    /// Remote cursor for status searches with more pages.
    pub next_cursor: Option<String>,
    pub computed_at: Millis,
}

pub struct ResultCache {
    /// Entry plus its insertion sequence, which orders same-millisecond writes.
    entries: FxHashMap<String, (u64, CacheEntry)>,
    seq: u64,
    ttl_ms: Millis,
    cap: usize,
}

impl ResultCache {
    pub fn new(ttl_ms: Millis, cap: usize) -> Self {
        Self { entries: FxHashMap::default(), seq: 0, ttl_ms, cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entry for `key` if it is younger than the TTL.
    pub fn get(&self, key: &str, now: Millis) -> Option<&CacheEntry> {
        self.entries.get(key).map(|(_, e)| e).filter(|e| now.saturating_sub(e.computed_at) < self.ttl_ms)
    }

    /// Insert and prune down to the `cap` most recently computed entries.
    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        self.seq += 1;
        self.entries.insert(key, (self.seq, entry));
        if self.entries.len() <= self.cap { return; }
        let mut by_age: Vec<(Millis, u64, String)> =
            self.entries.iter().map(|(k, (seq, e))| (e.computed_at, *seq, k.clone())).collect();
        by_age.sort();
        let excess = self.entries.len() - self.cap;
        for (_, _, k) in by_age.into_iter().take(excess) {
            self.entries.remove(&k);
        }
    }
}
