//! Denormalization: reconstructing typed data from stored records.
//!
//! The reader mirrors the normalizer's walk, but reading instead of
//! writing: for each selection it looks up the current record, resolves
//! references by key, and recurses. A [`CacheResolver`] hook can intercept
//! any field before the literal lookup (computed/derived reads).
//!
//! Cycle policy: object shapes can be recursive (shared via `Arc`), and
//! records can reference themselves, so the reader keeps the chain of keys
//! it is currently expanding. On revisiting a key already on the chain it
//! does not recurse again; it materializes the record's stored fields
//! verbatim (references rendered as `$ref` sentinels, not re-expanded).
//! Recursion depth is additionally capped. The reader never mutates the
//! store and never fabricates data.

use lattice_api::{
    CacheKey, CacheResolver, FieldContext, FieldPath, FieldValue, LatticeResult, ObjectShape,
    ReadError, Record, Selection, SelectionKind,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// Read-only view the reader pulls records from. The store composes an
/// overlay-first view on top of the backend; tests can read straight from
/// a record set.
pub trait RecordSource {
    /// Load the current record for a key, if present.
    fn record(&self, key: &CacheKey) -> Option<Record>;
}

/// How a read treats missing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Fail the whole read with a cache-miss error naming the first
    /// missing field path.
    #[default]
    Strict,
    /// Return a partial object with missing leaves nulled and the list of
    /// missing paths surfaced for diagnostics.
    Partial,
}

/// Result of a read pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// The reconstructed data; `None` only in partial mode when the root
    /// record itself is absent.
    pub data: Option<Value>,
    /// Paths that were absent (always empty in strict mode, which errors
    /// on the first one instead).
    pub missing: Vec<FieldPath>,
    /// Every record key touched during the pass; watchers use this as
    /// their dependency set.
    pub dependencies: BTreeSet<CacheKey>,
}

impl ReadResult {
    /// Whether the read found everything it asked for.
    pub fn is_complete(&self) -> bool {
        self.data.is_some() && self.missing.is_empty()
    }
}

/// Default cap on reference-expansion depth, guarding unverified graphs.
pub const DEFAULT_MAX_READ_DEPTH: usize = 64;

/// Stateless record-to-data reader.
pub struct Reader<'a> {
    source: &'a dyn RecordSource,
    cache_resolver: &'a dyn CacheResolver,
    max_depth: usize,
}

struct ReadState {
    mode: ReadMode,
    missing: Vec<FieldPath>,
    dependencies: BTreeSet<CacheKey>,
    /// Keys currently being expanded, outermost first.
    chain: Vec<CacheKey>,
}

impl<'a> Reader<'a> {
    /// Create a reader over a record source with the injected read hook.
    pub fn new(
        source: &'a dyn RecordSource,
        cache_resolver: &'a dyn CacheResolver,
        max_depth: usize,
    ) -> Self {
        Self {
            source,
            cache_resolver,
            max_depth,
        }
    }

    /// Reconstruct the data for `shape` rooted at `root_key`.
    pub fn read(
        &self,
        root_key: &CacheKey,
        shape: &ObjectShape,
        mode: ReadMode,
    ) -> LatticeResult<ReadResult> {
        let mut state = ReadState {
            mode,
            missing: Vec::new(),
            dependencies: BTreeSet::new(),
            chain: Vec::new(),
        };
        let data = self.read_record(root_key, shape, &FieldPath::root(), &mut state)?;
        Ok(ReadResult {
            data,
            missing: state.missing,
            dependencies: state.dependencies,
        })
    }

    fn read_record(
        &self,
        key: &CacheKey,
        shape: &ObjectShape,
        path: &FieldPath,
        state: &mut ReadState,
    ) -> LatticeResult<Option<Value>> {
        state.dependencies.insert(key.clone());
        let Some(record) = self.source.record(key) else {
            // Dangling references and evicted records surface here, as an
            // ordinary miss.
            return match self.miss(path, state)? {
                Value::Null => Ok(None),
                other => Ok(Some(other)),
            };
        };

        if state.chain.iter().any(|k| k == key) || state.chain.len() >= self.max_depth {
            return Ok(Some(shallow_value(&record)));
        }

        state.chain.push(key.clone());
        let object = self.read_fields(&record, "", shape, path, state);
        state.chain.pop();
        Ok(Some(Value::Object(object?)))
    }

    /// Read an object's selections out of `record`, composing field keys
    /// with `prefix` when the object was flattened inline at write time.
    fn read_fields(
        &self,
        record: &Record,
        prefix: &str,
        shape: &ObjectShape,
        path: &FieldPath,
        state: &mut ReadState,
    ) -> LatticeResult<serde_json::Map<String, Value>> {
        let mut object = serde_json::Map::new();
        for selection in &shape.selections {
            let field_key = compose(prefix, &selection.field_key());
            let field_path = path.child(&selection.name);
            let value = self.read_selection(record, &field_key, selection, &field_path, state)?;
            object.insert(selection.name.clone(), value);
        }
        Ok(object)
    }

    fn read_selection(
        &self,
        record: &Record,
        field_key: &str,
        selection: &Selection,
        path: &FieldPath,
        state: &mut ReadState,
    ) -> LatticeResult<Value> {
        let field_key_owned = field_key.to_string();
        // Computed/derived reads intercept before the literal lookup.
        let stored = self
            .cache_resolver
            .resolve_field(&FieldContext {
                record,
                selection,
                field_key: &field_key_owned,
                path,
            })
            .or_else(|| record.field(field_key).cloned());

        match &selection.kind {
            SelectionKind::Scalar => match stored {
                Some(value) => Ok(value.to_json()),
                None => self.miss(path, state),
            },
            SelectionKind::Object(shape) => match stored {
                Some(FieldValue::Null) => Ok(Value::Null),
                Some(FieldValue::Reference(target)) => {
                    Ok(self
                        .read_record(&target, shape, path, state)?
                        .unwrap_or(Value::Null))
                }
                Some(FieldValue::Object(map)) => {
                    // Inline object stored verbatim (e.g. handwritten
                    // records); render it as-is.
                    let value = FieldValue::Object(map).to_json();
                    Ok(value)
                }
                Some(_) => self.malformed(record, path, state, "expected object or reference"),
                None => {
                    // The object may have been flattened inline at write
                    // time; look for composite field keys.
                    let inline_prefix = format!("{field_key}.");
                    if record
                        .fields
                        .keys()
                        .any(|k| k.starts_with(&inline_prefix))
                    {
                        Ok(Value::Object(
                            self.read_fields(record, field_key, shape, path, state)?,
                        ))
                    } else {
                        self.miss(path, state)
                    }
                }
            },
            SelectionKind::List(element) => match stored {
                Some(FieldValue::Null) => Ok(Value::Null),
                Some(FieldValue::List(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        out.push(self.read_element(
                            record,
                            element,
                            item,
                            &path.index(index),
                            state,
                        )?);
                    }
                    Ok(Value::Array(out))
                }
                Some(_) => self.malformed(record, path, state, "expected list"),
                None => self.miss(path, state),
            },
        }
    }

    fn read_element(
        &self,
        record: &Record,
        kind: &SelectionKind,
        item: FieldValue,
        path: &FieldPath,
        state: &mut ReadState,
    ) -> LatticeResult<Value> {
        match kind {
            SelectionKind::Scalar => Ok(item.to_json()),
            SelectionKind::Object(shape) => match item {
                FieldValue::Null => Ok(Value::Null),
                FieldValue::Reference(target) => Ok(self
                    .read_record(&target, shape, path, state)?
                    .unwrap_or(Value::Null)),
                FieldValue::Object(map) => Ok(FieldValue::Object(map).to_json()),
                _ => self.malformed(record, path, state, "expected object or reference"),
            },
            SelectionKind::List(inner) => match item {
                FieldValue::Null => Ok(Value::Null),
                FieldValue::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (index, nested) in items.into_iter().enumerate() {
                        out.push(self.read_element(
                            record,
                            inner,
                            nested,
                            &path.index(index),
                            state,
                        )?);
                    }
                    Ok(Value::Array(out))
                }
                _ => self.malformed(record, path, state, "expected list"),
            },
        }
    }

    fn miss(&self, path: &FieldPath, state: &mut ReadState) -> LatticeResult<Value> {
        match state.mode {
            ReadMode::Strict => Err(ReadError::CacheMiss { path: path.clone() }.into()),
            ReadMode::Partial => {
                state.missing.push(path.clone());
                Ok(Value::Null)
            }
        }
    }

    fn malformed(
        &self,
        record: &Record,
        path: &FieldPath,
        state: &mut ReadState,
        reason: &str,
    ) -> LatticeResult<Value> {
        match state.mode {
            ReadMode::Strict => Err(ReadError::MalformedRecord {
                key: record.key.clone(),
                reason: format!("{reason} at {path}"),
            }
            .into()),
            ReadMode::Partial => {
                state.missing.push(path.clone());
                Ok(Value::Null)
            }
        }
    }
}

/// Materialize a record without expanding references: the cycle policy's
/// "reuse, don't re-expand" arm. References render as `$ref` sentinels.
fn shallow_value(record: &Record) -> Value {
    let map = record
        .fields
        .iter()
        .map(|(field, value)| (field.clone(), value.to_json()))
        .collect();
    Value::Object(map)
}

fn compose(prefix: &str, field_key: &str) -> String {
    if prefix.is_empty() {
        field_key.to_string()
    } else {
        format!("{prefix}.{field_key}")
    }
}
