//! Size-bounded trimming over a record store.
//!
//! When the store's estimated size exceeds the policy's `max_size_bytes`,
//! the evictor removes records oldest-first (by oldest recorded field
//! timestamp) until the size drops to `max_size_bytes * (1 - trim_ratio)`.
//! Removal can leave dangling references behind; subsequent reads treat
//! those as ordinary cache misses.

use chrono::{DateTime, Utc};
use lattice_api::{CacheKey, EvictionError, LatticeResult, Record, RecordStore};
use tracing::debug;

/// Size bound and trim aggressiveness for the evictor.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// Trigger threshold: evict when the estimated store size exceeds this.
    pub max_size_bytes: u64,
    /// Fraction of `max_size_bytes` to free, in `(0, 1]`. A ratio of 0.1
    /// trims down to 90% of the bound.
    pub trim_ratio: f64,
}

impl EvictionPolicy {
    /// Create a policy.
    pub fn new(max_size_bytes: u64, trim_ratio: f64) -> Self {
        Self {
            max_size_bytes,
            trim_ratio,
        }
    }

    /// Check the policy's invariants.
    pub fn validate(&self) -> LatticeResult<()> {
        if self.max_size_bytes == 0 {
            return Err(EvictionError::InvalidPolicy {
                reason: "max_size_bytes must be positive".to_string(),
            }
            .into());
        }
        if !(self.trim_ratio > 0.0 && self.trim_ratio <= 1.0) {
            return Err(EvictionError::InvalidPolicy {
                reason: format!("trim_ratio {} outside (0, 1]", self.trim_ratio),
            }
            .into());
        }
        Ok(())
    }

    /// The size the store is trimmed down to once triggered.
    pub fn target_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * (1.0 - self.trim_ratio)) as u64
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    /// Keys removed, oldest first.
    pub removed: Vec<CacheKey>,
    /// Estimated size before the pass.
    pub bytes_before: u64,
    /// Estimated size after the pass.
    pub bytes_after: u64,
}

impl EvictionReport {
    /// Whether the pass removed anything.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// LRU-by-write-time, size-bounded evictor.
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    /// Create an evictor for a policy.
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    /// Run one eviction pass over the store.
    ///
    /// Records with no recorded timestamp sort as oldest and go first. The
    /// newest record is never evicted; if keeping only the newest record
    /// still exceeds the target, the pass fails with
    /// [`EvictionError::TrimBelowSingleRecord`] before removing anything.
    pub fn evict(&self, store: &mut dyn RecordStore) -> LatticeResult<EvictionReport> {
        self.policy.validate()?;

        let mut entries: Vec<(CacheKey, u64, DateTime<Utc>)> = store
            .all_keys()
            .into_iter()
            .filter_map(|key| store.get(&key).map(|record| describe(key, &record)))
            .collect();
        let bytes_before: u64 = entries.iter().map(|(_, size, _)| size).sum();

        if bytes_before <= self.policy.max_size_bytes {
            return Ok(EvictionReport {
                removed: Vec::new(),
                bytes_before,
                bytes_after: bytes_before,
            });
        }

        // Oldest first; ties broken by key for deterministic passes.
        entries.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let target = self.policy.target_bytes();
        let mut remaining = bytes_before;
        let mut cutoff = 0;
        while remaining > target && cutoff < entries.len() {
            if cutoff == entries.len() - 1 {
                let (key, size, _) = &entries[cutoff];
                return Err(EvictionError::TrimBelowSingleRecord {
                    key: key.clone(),
                    record_bytes: *size,
                    target_bytes: target,
                }
                .into());
            }
            remaining -= entries[cutoff].1;
            cutoff += 1;
        }

        let mut removed = Vec::with_capacity(cutoff);
        for (key, _, _) in entries.drain(..cutoff) {
            store.remove(&key, false);
            removed.push(key);
        }
        debug!(
            removed = removed.len(),
            bytes_before,
            bytes_after = remaining,
            "eviction pass trimmed store"
        );
        Ok(EvictionReport {
            removed,
            bytes_before,
            bytes_after: remaining,
        })
    }
}

fn describe(key: CacheKey, record: &Record) -> (CacheKey, u64, DateTime<Utc>) {
    let oldest = record
        .oldest_received_at()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    (key, record.estimated_size_bytes(), oldest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use chrono::TimeZone;
    use lattice_api::{CacheHeaders, FieldValue, LatticeError, Record};

    fn store_with(records: Vec<(&str, &str, i64)>) -> MemoryRecordStore {
        // (key, payload, received_at millis)
        let mut store = MemoryRecordStore::new();
        for (key, payload, millis) in records {
            let at = Utc.timestamp_millis_opt(millis).single().unwrap();
            store.merge(
                vec![Record::new(key).with_field("data", FieldValue::String(payload.into()))],
                &CacheHeaders::none(),
                at,
            );
        }
        store
    }

    #[test]
    fn test_no_eviction_under_bound() {
        let mut store = store_with(vec![("A:1", "x", 1_000)]);
        let report = Evictor::new(EvictionPolicy::new(10_000, 0.5))
            .evict(&mut store)
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_first_until_target() {
        let mut store = store_with(vec![
            ("A:1", "aaaaaaaaaaaaaaaaaaaa", 1_000),
            ("B:1", "bbbbbbbbbbbbbbbbbbbb", 2_000),
            ("C:1", "cccccccccccccccccccc", 3_000),
        ]);
        let total = store.estimated_size_bytes();
        let policy = EvictionPolicy::new(total - 1, 0.5);
        let target = policy.target_bytes();

        let report = Evictor::new(policy).evict(&mut store).unwrap();
        assert!(!report.is_empty());
        assert!(report.bytes_after <= target);
        // Oldest removed first; the newest survives.
        assert_eq!(report.removed[0], CacheKey::new("A:1"));
        assert!(store.get(&CacheKey::new("C:1")).is_some());
        // Every removed record is older than every retained one.
        assert!(!report.removed.contains(&CacheKey::new("C:1")));
    }

    #[test]
    fn test_trim_below_single_record_is_an_error() {
        let mut store = store_with(vec![(
            "A:1",
            "a-rather-long-payload-that-cannot-be-split",
            1_000,
        )]);
        let err = Evictor::new(EvictionPolicy::new(1, 1.0))
            .evict(&mut store)
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Eviction(EvictionError::TrimBelowSingleRecord { .. })
        ));
        // Surfaced before mutating anything.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut store = store_with(vec![]);
        let err = Evictor::new(EvictionPolicy::new(100, 0.0))
            .evict(&mut store)
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Eviction(EvictionError::InvalidPolicy { .. })
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// After a successful pass the store is at or under the
            /// target, and the newest record always survives.
            #[test]
            fn prop_evict_respects_target_and_keeps_newest(
                payload_lens in proptest::collection::vec(1usize..64, 2..12),
                trim_ratio in 0.1f64..=1.0,
            ) {
                let mut store = MemoryRecordStore::new();
                let count = payload_lens.len();
                for (i, len) in payload_lens.into_iter().enumerate() {
                    let at = Utc.timestamp_millis_opt((i as i64 + 1) * 1_000).single().unwrap();
                    store.merge(
                        vec![Record::new(format!("Blob:{i:03}"))
                            .with_field("data", FieldValue::String("x".repeat(len)))],
                        &CacheHeaders::none(),
                        at,
                    );
                }
                let total = store.estimated_size_bytes();
                let policy = EvictionPolicy::new(total.saturating_sub(1).max(1), trim_ratio);
                let target = policy.target_bytes();
                let newest = CacheKey::new(format!("Blob:{:03}", count - 1));

                match Evictor::new(policy).evict(&mut store) {
                    Ok(report) => {
                        prop_assert!(report.bytes_after <= target);
                        prop_assert!(store.get(&newest).is_some());
                        prop_assert!(!report.removed.contains(&newest));
                    }
                    Err(LatticeError::Eviction(
                        EvictionError::TrimBelowSingleRecord { .. },
                    )) => {
                        // Refused rather than evicting the newest record;
                        // nothing was removed.
                        prop_assert_eq!(store.len(), count);
                    }
                    Err(other) => return Err(TestCaseError::fail(other.to_string())),
                }
            }
        }
    }

    #[test]
    fn test_ancient_records_evict_first() {
        let mut store = store_with(vec![("B:1", "bbbbbbbbbbbbbbbbbbbb", 2_000)]);
        // Merged at the epoch, so it sorts as the oldest record.
        let mut bare = Record::new("A:1");
        bare.insert_field("data", FieldValue::String("aaaaaaaaaaaaaaaaaaaa".into()));
        store.merge(
            vec![bare],
            &CacheHeaders::none(),
            Utc.timestamp_millis_opt(0).single().unwrap(),
        );

        let total = store.estimated_size_bytes();
        let report = Evictor::new(EvictionPolicy::new(total - 1, 0.6))
            .evict(&mut store)
            .unwrap();
        assert_eq!(report.removed[0], CacheKey::new("A:1"));
    }
}
