//! In-memory record store backend.

use chrono::{DateTime, Utc};
use lattice_api::{
    CacheHeaders, CacheKey, ChangedKey, FieldRecordMerger, Record, RecordMerger, RecordStore,
    DO_NOT_STORE, EVICT_AFTER_READ,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics about a [`MemoryRecordStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of lookups that found a record.
    pub hits: u64,
    /// Number of lookups that missed.
    pub misses: u64,
    /// Number of merge calls applied.
    pub merges: u64,
    /// Records currently stored.
    pub record_count: u64,
    /// Estimated total size of stored records.
    pub size_bytes: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// HashMap-backed [`RecordStore`] with an injected merger.
///
/// All access arrives under the orchestrator's lock, so the map itself
/// needs no interior synchronization; only the hit/miss counters are
/// atomic because `get` takes `&self`.
pub struct MemoryRecordStore {
    records: HashMap<CacheKey, Record>,
    merger: Arc<dyn RecordMerger>,
    hits: AtomicU64,
    misses: AtomicU64,
    merges: AtomicU64,
}

impl MemoryRecordStore {
    /// Create an empty store using the default field merger.
    pub fn new() -> Self {
        Self::with_merger(Arc::new(FieldRecordMerger::new()))
    }

    /// Create an empty store with a custom merger.
    pub fn with_merger(merger: Arc<dyn RecordMerger>) -> Self {
        Self {
            records: HashMap::new(),
            merger,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            merges: AtomicU64::new(0),
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated total size of all stored records.
    pub fn estimated_size_bytes(&self) -> u64 {
        self.records.values().map(Record::estimated_size_bytes).sum()
    }

    /// Snapshot of usage statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            record_count: self.records.len() as u64,
            size_bytes: self.estimated_size_bytes(),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, key: &CacheKey) -> Option<Record> {
        let record = self.records.get(key).cloned();
        match record {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        record
    }

    fn merge(
        &mut self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        at: DateTime<Utc>,
    ) -> BTreeSet<ChangedKey> {
        let mut changed = BTreeSet::new();
        if headers.has(DO_NOT_STORE) {
            return changed;
        }
        self.merges.fetch_add(1, Ordering::Relaxed);

        for incoming in records {
            let existing = self.records.get(&incoming.key);
            let (mut merged, changed_fields) = self.merger.merge(existing, &incoming, at);
            if headers.has(EVICT_AFTER_READ) {
                merged.set_evict_after_read();
            } else {
                merged.clear_evict_after_read();
            }
            for field in changed_fields {
                changed.insert(ChangedKey::new(incoming.key.clone(), field));
            }
            self.records.insert(incoming.key.clone(), merged);
        }
        changed
    }

    fn remove(&mut self, key: &CacheKey, cascade: bool) -> bool {
        let Some(record) = self.records.remove(key) else {
            return false;
        };
        if cascade {
            // Breadth-first over reference edges; the visited set makes
            // cyclic graphs terminate.
            let mut visited: HashSet<CacheKey> = HashSet::new();
            visited.insert(key.clone());
            let mut queue = record.referenced_keys();
            while let Some(next) = queue.pop() {
                if !visited.insert(next.clone()) {
                    continue;
                }
                if let Some(removed) = self.records.remove(&next) {
                    queue.extend(removed.referenced_keys());
                }
            }
        }
        true
    }

    fn all_keys(&self) -> Vec<CacheKey> {
        self.records.keys().cloned().collect()
    }
}
