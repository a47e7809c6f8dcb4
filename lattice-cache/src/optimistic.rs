//! Optimistic overlay: speculative records applied before a mutation's
//! real response arrives.
//!
//! The overlay is a per-key journal of optimistic records tagged with the
//! mutation id that owns them. Lookups squash the journal in application
//! order (later writer wins per field); when a key is present here it
//! shadows the base store entirely. Rollback removes exactly one
//! mutation's records; a real merge for the same keys supersedes the
//! overlay entries for those keys.

use lattice_api::{CacheKey, ChangedKey, FieldKey, MutationId, Record, RecordSet};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Two concurrent optimistic overlays touched the same field key. Resolved
/// by last-writer-wins; surfaced for observability, never thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// The record both mutations touched.
    pub key: CacheKey,
    /// The contested field.
    pub field: FieldKey,
    /// The mutation that wrote first.
    pub first: MutationId,
    /// The mutation that wrote last (and wins).
    pub second: MutationId,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "optimistic conflict on {}.{}: {} overwrites {}",
            self.key, self.field, self.second, self.first
        )
    }
}

/// Transient layer of optimistic records, keyed by record key with one
/// journal entry per applied mutation.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    journal: HashMap<CacheKey, Vec<Record>>,
}

impl OptimisticOverlay {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no optimistic records are active.
    pub fn is_empty(&self) -> bool {
        self.journal.is_empty()
    }

    /// Apply a mutation's record set on top of the overlay.
    ///
    /// Returns the changed keys (every field written) and any conflicts
    /// with other still-active mutations.
    pub fn apply(
        &mut self,
        mutation_id: MutationId,
        records: RecordSet,
    ) -> (BTreeSet<ChangedKey>, Vec<MergeConflict>) {
        let mut changed = BTreeSet::new();
        let mut conflicts = Vec::new();

        for mut record in records.into_records() {
            record.mutation_id = Some(mutation_id);
            let entries = self.journal.entry(record.key.clone()).or_default();
            for field in record.fields.keys() {
                if let Some(previous) = entries
                    .iter()
                    .rev()
                    .find(|r| r.mutation_id != Some(mutation_id) && r.fields.contains_key(field))
                {
                    conflicts.push(MergeConflict {
                        key: record.key.clone(),
                        field: field.clone(),
                        first: previous.mutation_id.unwrap_or_else(MutationId::nil),
                        second: mutation_id,
                    });
                }
                changed.insert(ChangedKey::new(record.key.clone(), field.clone()));
            }
            entries.push(record);
        }
        (changed, conflicts)
    }

    /// The squashed optimistic view for a key, if any mutation touched it.
    ///
    /// Journal entries fold in application order; a present key shadows
    /// the base store entirely.
    pub fn lookup(&self, key: &CacheKey) -> Option<Record> {
        let entries = self.journal.get(key)?;
        let mut squashed = Record::new(key.clone());
        for entry in entries {
            squashed.fields.extend(entry.fields.clone());
            squashed.mutation_id = entry.mutation_id;
            for (field, meta) in &entry.metadata {
                squashed
                    .metadata
                    .entry(field.clone())
                    .or_default()
                    .extend(meta.clone());
            }
        }
        Some(squashed)
    }

    /// Remove every record belonging to `mutation_id`, returning the
    /// changed keys so watchers can re-read.
    pub fn rollback(&mut self, mutation_id: MutationId) -> BTreeSet<ChangedKey> {
        let mut changed = BTreeSet::new();
        self.journal.retain(|key, entries| {
            entries.retain(|record| {
                if record.mutation_id == Some(mutation_id) {
                    for field in record.fields.keys() {
                        changed.insert(ChangedKey::new(key.clone(), field.clone()));
                    }
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        changed
    }

    /// Drop all overlay entries for the given keys: a real merge for those
    /// keys has arrived and supersedes the speculation.
    pub fn supersede(&mut self, keys: &[CacheKey]) -> BTreeSet<ChangedKey> {
        let mut changed = BTreeSet::new();
        for key in keys {
            if let Some(entries) = self.journal.remove(key) {
                for record in entries {
                    for field in record.fields.keys() {
                        changed.insert(ChangedKey::new(key.clone(), field.clone()));
                    }
                }
            }
        }
        changed
    }

    /// Keys currently shadowed by the overlay.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.journal.keys().cloned().collect()
    }
}
