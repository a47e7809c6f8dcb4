//! Record and field value types - the atomic storage units of the cache.
//!
//! A [`Record`] is one normalized object: a flat map of field keys to
//! scalar values, lists, inline objects, or [`FieldValue::Reference`]s
//! pointing at other records by [`CacheKey`]. The whole cache is a
//! key-indexed arena of records; every edge between objects is a string
//! key resolved through the store, which keeps cyclic graphs safe to
//! store and serialize.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of an optimistic overlay batch (one in-flight mutation).
pub type MutationId = Uuid;

/// A field name plus serialized arguments, used as a map key within a record.
pub type FieldKey = String;

/// Sentinel object key used when serializing a [`FieldValue::Reference`]
/// to JSON, so persisted blobs survive a round trip.
pub const REFERENCE_SENTINEL: &str = "$ref";

/// Well-known metadata keys.
pub mod meta {
    /// Per-field metadata map key holding the last-written timestamp
    /// (milliseconds since the Unix epoch). Consumed by the evictor.
    pub const RECEIVED_AT: &str = "received_at";

    /// Reserved pseudo-field for record-level metadata.
    pub const RECORD: &str = "__record";

    /// Record-level flag: remove this record once the next read that
    /// touches it completes.
    pub const EVICT_AFTER_READ: &str = "evict_after_read";
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// Stable string identifier for a [`Record`], e.g. `"User:42"` or
/// `"QUERY_ROOT"`.
///
/// Keys are unique within a store generation: two records with the same
/// key are never stored independently, they are merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from an arbitrary string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The fixed root key for query operations.
    pub fn query_root() -> Self {
        Self("QUERY_ROOT".to_string())
    }

    /// Build a key from a typename and an identity value, e.g. `"User:42"`.
    pub fn from_typename_id(typename: &str, id: &str) -> Self {
        Self(format!("{typename}:{id}"))
    }

    /// Build a root key for a named operation with its variables, e.g.
    /// `"GetUser(id:42)"`. Variables serialize deterministically (sorted).
    pub fn operation(name: &str, variables: &BTreeMap<String, serde_json::Value>) -> Self {
        Self(field_key(name, variables))
    }

    /// Synthesize a structural fallback key for an object with no identity,
    /// derived from its parent key and the path segment reaching it.
    ///
    /// This makes embedded objects addressable without any resolver
    /// configuration.
    pub fn structural(parent: &CacheKey, segment: &str) -> Self {
        Self(format!("{}.{segment}", parent.0))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Serialize a field name plus arguments into a deterministic [`FieldKey`].
///
/// Argument names are already sorted (callers pass a `BTreeMap`) and values
/// render as compact JSON, so `field(a:1)` always collides with itself and
/// never with `field(a:2)`.
pub fn field_key(name: &str, arguments: &BTreeMap<String, serde_json::Value>) -> FieldKey {
    if arguments.is_empty() {
        return name.to_string();
    }
    let args = arguments
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}({args})")
}

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A value stored under a field key inside a [`Record`].
///
/// `Reference` is the only variant that introduces an edge between records;
/// everything else is owned data. `Object` holds identity-less structures
/// that could not be flattened into the parent (e.g. list elements).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean scalar.
    Boolean(bool),
    /// Numeric scalar (arbitrary JSON number).
    Number(serde_json::Number),
    /// String scalar (also used for enums).
    String(String),
    /// Ordered list of values; elements may themselves be references.
    List(Vec<FieldValue>),
    /// Inline object kept embedded in its owning record.
    Object(BTreeMap<String, FieldValue>),
    /// Edge to another record, by cache key.
    Reference(CacheKey),
}

impl FieldValue {
    /// Convert a raw response value (straight off the wire) into a field
    /// value. No `$ref` interpretation happens here: response data can
    /// never smuggle a reference into the cache.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => Self::Number(n.clone()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert a persisted JSON value back into a field value, decoding the
    /// `{"$ref": key}` sentinel produced by [`FieldValue::to_json`].
    pub fn from_stored_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => Self::Number(n.clone()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_stored_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(key)) = map.get(REFERENCE_SENTINEL) {
                        return Self::Reference(CacheKey::new(key.clone()));
                    }
                }
                Self::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_stored_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Render as JSON. References become `{"$ref": key}` sentinel objects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Reference(key) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    REFERENCE_SENTINEL.to_string(),
                    serde_json::Value::String(key.as_str().to_string()),
                );
                serde_json::Value::Object(map)
            }
        }
    }

    /// Whether this value is a reference edge.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// The referenced key, if this value is a reference.
    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            Self::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// Rough in-memory footprint, used for eviction accounting.
    pub fn estimated_size_bytes(&self) -> u64 {
        match self {
            Self::Null => 4,
            Self::Boolean(_) => 1,
            Self::Number(_) => 8,
            Self::String(s) => s.len() as u64,
            Self::List(items) => items.iter().map(Self::estimated_size_bytes).sum(),
            Self::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() as u64 + v.estimated_size_bytes())
                .sum(),
            Self::Reference(key) => key.as_str().len() as u64,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_stored_json(&value))
    }
}

// ============================================================================
// RECORD
// ============================================================================

/// One normalized object: a flat map of field keys to values, plus
/// out-of-band per-field metadata.
///
/// Records are created by the normalizer on first write, mutated by the
/// record merger on subsequent merges, and destroyed only by eviction or an
/// explicit remove. Optimistic records carry a `mutation_id` and live only
/// inside the optimistic overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique key for this record.
    pub key: CacheKey,
    /// Field key to value map.
    pub fields: BTreeMap<FieldKey, FieldValue>,
    /// Set only for optimistic records; identifies the overlay batch that
    /// owns this record, for targeted rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<MutationId>,
    /// Per-field metadata (e.g. last-written timestamp).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<FieldKey, BTreeMap<String, serde_json::Value>>,
}

impl Record {
    /// Create an empty record under the given key.
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            mutation_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Tag this record as belonging to an optimistic mutation.
    pub fn with_mutation_id(mut self, mutation_id: MutationId) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }

    /// Set a field value, returning the record for chaining.
    pub fn with_field(mut self, field: impl Into<FieldKey>, value: FieldValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Insert or overwrite a field value.
    pub fn insert_field(&mut self, field: impl Into<FieldKey>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    /// Look up a field value.
    pub fn field(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Record the last-written timestamp for a field.
    pub fn set_received_at(&mut self, field: &str, at: DateTime<Utc>) {
        self.metadata
            .entry(field.to_string())
            .or_default()
            .insert(
                meta::RECEIVED_AT.to_string(),
                serde_json::Value::from(at.timestamp_millis()),
            );
    }

    /// The last-written timestamp for a field, if recorded.
    pub fn received_at(&self, field: &str) -> Option<DateTime<Utc>> {
        let millis = self.metadata.get(field)?.get(meta::RECEIVED_AT)?.as_i64()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// The oldest recorded field timestamp, driving eviction ordering.
    pub fn oldest_received_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .keys()
            .filter_map(|field| self.received_at(field))
            .min()
    }

    /// Flag this record for removal once the next read touching it completes.
    pub fn set_evict_after_read(&mut self) {
        self.metadata
            .entry(meta::RECORD.to_string())
            .or_default()
            .insert(
                meta::EVICT_AFTER_READ.to_string(),
                serde_json::Value::Bool(true),
            );
    }

    /// Clear the evict-after-read flag. A fresh merge without the header
    /// makes the record ordinary again.
    pub fn clear_evict_after_read(&mut self) {
        if let Some(record_meta) = self.metadata.get_mut(meta::RECORD) {
            record_meta.remove(meta::EVICT_AFTER_READ);
            if record_meta.is_empty() {
                self.metadata.remove(meta::RECORD);
            }
        }
    }

    /// Whether this record is flagged for removal after the next read.
    pub fn evict_after_read(&self) -> bool {
        self.metadata
            .get(meta::RECORD)
            .and_then(|m| m.get(meta::EVICT_AFTER_READ))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Every cache key this record references.
    pub fn referenced_keys(&self) -> Vec<CacheKey> {
        fn collect(value: &FieldValue, out: &mut Vec<CacheKey>) {
            match value {
                FieldValue::Reference(key) => out.push(key.clone()),
                FieldValue::List(items) => items.iter().for_each(|v| collect(v, out)),
                FieldValue::Object(map) => map.values().for_each(|v| collect(v, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for value in self.fields.values() {
            collect(value, &mut out);
        }
        out
    }

    /// Rough in-memory footprint of this record, used for eviction bounds.
    pub fn estimated_size_bytes(&self) -> u64 {
        let fields: u64 = self
            .fields
            .iter()
            .map(|(k, v)| k.len() as u64 + v.estimated_size_bytes())
            .sum();
        self.key.as_str().len() as u64 + fields
    }
}

// ============================================================================
// RECORD SET
// ============================================================================

/// The mutation unit: a key to record mapping produced by one normalization
/// pass, merged field-by-field into the record store and then discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<CacheKey, Record>,
}

impl RecordSet {
    /// Create an empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. If the set already holds a record for the same key
    /// (the same object reached twice in one pass), fields and metadata fold
    /// together with the later write winning per field.
    pub fn insert(&mut self, record: Record) {
        match self.records.get_mut(&record.key) {
            Some(existing) => {
                existing.fields.extend(record.fields);
                for (field, meta) in record.metadata {
                    existing.metadata.entry(field).or_default().extend(meta);
                }
                if record.mutation_id.is_some() {
                    existing.mutation_id = record.mutation_id;
                }
            }
            None => {
                self.records.insert(record.key.clone(), record);
            }
        }
    }

    /// Look up a record by key.
    pub fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.records.get(key)
    }

    /// All keys in this set, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.records.keys()
    }

    /// Iterate over the records in key order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Number of records in the set.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume the set, yielding records in key order.
    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }

    /// Tag every record in the set with a mutation id (optimistic writes).
    pub fn with_mutation_id(mut self, mutation_id: MutationId) -> Self {
        for record in self.records.values_mut() {
            record.mutation_id = Some(mutation_id);
        }
        self
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

/// A single changed field, qualified by its record key. The set of changed
/// keys produced by a merge is the unit of cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangedKey {
    /// The record whose field changed.
    pub key: CacheKey,
    /// The field key that changed.
    pub field: FieldKey,
}

impl ChangedKey {
    /// Create a changed-key entry.
    pub fn new(key: impl Into<CacheKey>, field: impl Into<FieldKey>) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for ChangedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.field)
    }
}

// =============================================================================
// TESTS
// =============================================================================
