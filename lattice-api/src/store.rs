//! The pluggable record store backend interface.

use crate::headers::CacheHeaders;
use crate::record::{CacheKey, ChangedKey, Record};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Key to record storage with get/merge/remove, implemented by an in-memory
/// map, a SQL-backed store, or any other backing engine.
///
/// Implementations are synchronous: the normalization and denormalization
/// algorithms are pure computations over already-resident data, and all
/// calls arrive under the orchestrator's readers-writer lock. A persisted
/// layout for a SQL backend is one row per record
/// `(key TEXT PRIMARY KEY, fields BLOB, mutation_id TEXT NULL,
/// updated_at INTEGER)`; [`Record`] is serde-serializable for exactly this
/// purpose.
///
/// # Header handling
///
/// `merge` must honor [`crate::headers::DO_NOT_STORE`] (skip the merge
/// entirely) and [`crate::headers::EVICT_AFTER_READ`] (flag merged records
/// via [`Record::set_evict_after_read`]; a merge without the header clears
/// the flag on the merged records, so fresh data is never swept on behalf
/// of an earlier flagged write).
/// [`crate::headers::STORE_PARTIAL_RESPONSES`] is decided upstream, before
/// normalization; by the time records reach a backend they are always
/// storable.
pub trait RecordStore: Send + Sync {
    /// Load a record by key.
    fn get(&self, key: &CacheKey) -> Option<Record>;

    /// Merge a collection of records, returning the set of changed field
    /// keys qualified by their record keys.
    ///
    /// `at` is the timestamp stamped into per-field `received_at` metadata
    /// for every changed field.
    fn merge(
        &mut self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        at: DateTime<Utc>,
    ) -> BTreeSet<ChangedKey>;

    /// Remove a record. With `cascade`, also remove every record reachable
    /// through its reference edges (cycle-safe). Returns whether the named
    /// record existed.
    ///
    /// Removing a record that others still reference leaves dangling
    /// references behind; readers treat those as ordinary cache misses.
    fn remove(&mut self, key: &CacheKey, cascade: bool) -> bool;

    /// All record keys currently stored, for eviction scans.
    fn all_keys(&self) -> Vec<CacheKey>;
}
