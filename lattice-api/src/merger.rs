//! Record merging: folding an incoming record into an existing one.
//!
//! Merging is additive, never destructive: a partial write cannot erase
//! fields the incoming record did not mention. The set of changed field
//! keys a merge reports is the unit of cache invalidation downstream.

use crate::record::{FieldKey, Record};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Merges an incoming record into an existing one.
///
/// Implementations must be stateless and reentrant; the same merger
/// instance is shared across concurrent merges.
pub trait RecordMerger: Send + Sync {
    /// Merge `incoming` into `existing`, producing the merged record and
    /// the set of field keys whose values changed.
    ///
    /// Rules:
    /// - A field absent in `existing`, or whose value differs (deep
    ///   equality for embedded structures, key equality for references),
    ///   takes the incoming value and is reported changed.
    /// - Fields present only in `existing` are preserved untouched.
    /// - When `existing` is `None` the incoming record is stored as-is and
    ///   every field is reported changed.
    ///
    /// Changed fields are stamped with a `received_at` timestamp of `at` in
    /// the merged record's metadata.
    fn merge(
        &self,
        existing: Option<&Record>,
        incoming: &Record,
        at: DateTime<Utc>,
    ) -> (Record, BTreeSet<FieldKey>);
}

/// The default field-by-field merger.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldRecordMerger;

impl FieldRecordMerger {
    /// Create the default merger.
    pub fn new() -> Self {
        Self
    }
}

impl RecordMerger for FieldRecordMerger {
    fn merge(
        &self,
        existing: Option<&Record>,
        incoming: &Record,
        at: DateTime<Utc>,
    ) -> (Record, BTreeSet<FieldKey>) {
        let mut changed = BTreeSet::new();

        let Some(existing) = existing else {
            let mut merged = incoming.clone();
            for field in merged.fields.keys().cloned().collect::<Vec<_>>() {
                changed.insert(field.clone());
                merged.set_received_at(&field, at);
            }
            return (merged, changed);
        };

        let mut merged = existing.clone();
        // Incoming metadata (if any) folds in regardless of value changes.
        for (field, meta) in &incoming.metadata {
            merged
                .metadata
                .entry(field.clone())
                .or_default()
                .extend(meta.clone());
        }
        if incoming.mutation_id.is_some() {
            merged.mutation_id = incoming.mutation_id;
        }

        for (field, value) in &incoming.fields {
            if existing.field(field) != Some(value) {
                changed.insert(field.clone());
                merged.set_received_at(field, at);
            }
            merged.fields.insert(field.clone(), value.clone());
        }

        (merged, changed)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CacheKey, FieldValue};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn at() -> DateTime<Utc> {
        chrono::TimeZone::timestamp_millis_opt(&Utc, 1_700_000_000_000)
            .single()
            .unwrap()
    }

    #[test]
    fn test_merge_without_existing_reports_all_fields_changed() {
        let incoming = Record::new("User:1")
            .with_field("name", FieldValue::String("A".into()))
            .with_field("age", FieldValue::Number(30.into()));
        let (merged, changed) = FieldRecordMerger::new().merge(None, &incoming, at());
        assert_eq!(merged.fields, incoming.fields);
        assert_eq!(
            changed,
            BTreeSet::from(["age".to_string(), "name".to_string()])
        );
        assert_eq!(merged.received_at("name"), Some(at()));
    }

    #[test]
    fn test_merge_is_additive() {
        // Scenario: merge {name: "A"} then {age: 30} -> {name: "A", age: 30},
        // second merge changed-keys = {age}.
        let merger = FieldRecordMerger::new();
        let first = Record::new("User:1").with_field("name", FieldValue::String("A".into()));
        let (merged, _) = merger.merge(None, &first, at());

        let second = Record::new("User:1").with_field("age", FieldValue::Number(30.into()));
        let (merged, changed) = merger.merge(Some(&merged), &second, at());

        assert_eq!(merged.field("name"), Some(&FieldValue::String("A".into())));
        assert_eq!(merged.field("age"), Some(&FieldValue::Number(30.into())));
        assert_eq!(changed, BTreeSet::from(["age".to_string()]));
    }

    #[test]
    fn test_merge_same_value_reports_no_change() {
        let merger = FieldRecordMerger::new();
        let record = Record::new("User:1").with_field("name", FieldValue::String("A".into()));
        let (merged, _) = merger.merge(None, &record, at());
        let (remerged, changed) = merger.merge(Some(&merged), &record, at());
        assert!(changed.is_empty());
        assert_eq!(remerged.fields, merged.fields);
    }

    #[test]
    fn test_merge_reference_compared_by_key() {
        let merger = FieldRecordMerger::new();
        let first =
            Record::new("QUERY_ROOT").with_field("user", FieldValue::Reference("User:1".into()));
        let (merged, _) = merger.merge(None, &first, at());

        let same =
            Record::new("QUERY_ROOT").with_field("user", FieldValue::Reference("User:1".into()));
        let (_, changed) = merger.merge(Some(&merged), &same, at());
        assert!(changed.is_empty());

        let different =
            Record::new("QUERY_ROOT").with_field("user", FieldValue::Reference("User:2".into()));
        let (_, changed) = merger.merge(Some(&merged), &different, at());
        assert_eq!(changed, BTreeSet::from(["user".to_string()]));
    }

    #[test]
    fn test_merge_deep_equality_for_embedded_objects() {
        let merger = FieldRecordMerger::new();
        let inline = |amount: i64| {
            let mut map = BTreeMap::new();
            map.insert("amount".to_string(), FieldValue::Number(amount.into()));
            FieldValue::Object(map)
        };
        let (merged, _) = merger.merge(
            None,
            &Record::new("Order:1").with_field("price", inline(10)),
            at(),
        );
        let (_, changed) = merger.merge(
            Some(&merged),
            &Record::new("Order:1").with_field("price", inline(10)),
            at(),
        );
        assert!(changed.is_empty());
        let (_, changed) = merger.merge(
            Some(&merged),
            &Record::new("Order:1").with_field("price", inline(11)),
            at(),
        );
        assert!(!changed.is_empty());
    }

    #[test]
    fn test_merge_preserves_mutation_id_of_incoming() {
        let merger = FieldRecordMerger::new();
        let base = Record::new("User:1").with_field("name", FieldValue::String("A".into()));
        let (merged, _) = merger.merge(None, &base, at());

        let mutation = uuid::Uuid::now_v7();
        let optimistic = Record::new("User:1")
            .with_field("name", FieldValue::String("B".into()))
            .with_mutation_id(mutation);
        let (merged, _) = merger.merge(Some(&merged), &optimistic, at());
        assert_eq!(merged.mutation_id, Some(mutation));
    }

    fn arb_scalar() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Boolean),
            any::<i64>().prop_map(|n| FieldValue::Number(n.into())),
            "[a-z]{0,8}".prop_map(FieldValue::String),
        ]
    }

    fn arb_fields() -> impl Strategy<Value = BTreeMap<FieldKey, FieldValue>> {
        proptest::collection::btree_map("[a-z]{1,6}", arb_scalar(), 0..8)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Merging the same record twice yields the same fields and an
        /// empty changed set on the second merge.
        #[test]
        fn prop_merge_idempotent(fields in arb_fields()) {
            let merger = FieldRecordMerger::new();
            let mut incoming = Record::new("User:1");
            incoming.fields = fields;

            let (first, _) = merger.merge(None, &incoming, at());
            let (second, changed) = merger.merge(Some(&first), &incoming, at());

            prop_assert!(changed.is_empty());
            prop_assert_eq!(second.fields, first.fields);
        }

        /// Merging a record touching only disjoint fields never alters
        /// existing fields.
        #[test]
        fn prop_merge_additive(
            base_fields in arb_fields(),
            extra in arb_scalar(),
        ) {
            let merger = FieldRecordMerger::new();
            let mut base = Record::new("User:1");
            base.fields = base_fields;
            let (merged, _) = merger.merge(None, &base, at());

            // A field key outside the generated alphabet length.
            let incoming = Record::new("User:1").with_field("zzzzzzzzzz", extra);
            let (remerged, changed) = merger.merge(Some(&merged), &incoming, at());

            for (field, value) in &merged.fields {
                if field != "zzzzzzzzzz" {
                    prop_assert_eq!(remerged.field(field), Some(value));
                }
            }
            prop_assert!(changed.iter().all(|f| f == "zzzzzzzzzz"));
        }
    }
}
