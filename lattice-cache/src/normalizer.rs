//! Normalization: flattening a typed response into a set of records.
//!
//! The normalizer walks a response value depth-first, guided by its
//! [`ObjectShape`]. Objects with an identity (as decided by the injected
//! [`CacheKeyResolver`]) become their own records, leaving a
//! [`FieldValue::Reference`] in the parent field. Objects without identity
//! are flattened inline under composite field keys (`parent.child`);
//! identity-less list elements, which cannot be flattened, get structural
//! fallback keys derived from the parent path so they stay addressable.
//!
//! Normalizing is a pure computation and never fails: missing or extra
//! fields are tolerated by construction. Writing the resulting
//! [`RecordSet`] into a store is a separate, explicit merge step, so
//! callers can normalize speculatively (e.g. to compute a diff) without
//! mutating anything.

use lattice_api::{
    CacheKey, CacheKeyResolver, FieldValue, KeyContext, ObjectShape, Record, RecordSet, Selection,
    SelectionKind,
};
use serde_json::Value;

/// Stateless response-to-records normalizer.
pub struct Normalizer<'a> {
    key_resolver: &'a dyn CacheKeyResolver,
}

impl<'a> Normalizer<'a> {
    /// Create a normalizer around an injected key resolver.
    pub fn new(key_resolver: &'a dyn CacheKeyResolver) -> Self {
        Self { key_resolver }
    }

    /// Normalize a response value for the given shape, rooted at `root_key`.
    ///
    /// The input is a tree (responses cannot be self-referential), but two
    /// subtrees normalizing to the same key fold into one record, which is
    /// how cyclic graphs enter the cache.
    pub fn normalize(&self, root_key: CacheKey, shape: &ObjectShape, data: &Value) -> RecordSet {
        let mut records = RecordSet::new();
        if let Value::Object(object) = data {
            self.normalize_object(&root_key, shape, object, &mut records);
        }
        records
    }

    fn normalize_object(
        &self,
        key: &CacheKey,
        shape: &ObjectShape,
        object: &serde_json::Map<String, Value>,
        records: &mut RecordSet,
    ) {
        let mut record = Record::new(key.clone());
        self.normalize_fields(key, "", shape, object, &mut record, records);
        records.insert(record);
    }

    /// Normalize an object's fields into `record`, prefixing field keys
    /// with `prefix` when flattening an identity-less child inline.
    fn normalize_fields(
        &self,
        record_key: &CacheKey,
        prefix: &str,
        shape: &ObjectShape,
        object: &serde_json::Map<String, Value>,
        record: &mut Record,
        records: &mut RecordSet,
    ) {
        for selection in &shape.selections {
            let field_key = compose(prefix, &selection.field_key());
            // Absent fields are skipped, not stored: merges stay additive.
            let Some(value) = object.get(&selection.name) else {
                continue;
            };
            match &selection.kind {
                SelectionKind::Scalar => {
                    record.insert_field(field_key, FieldValue::from_json(value));
                }
                SelectionKind::Object(child_shape) => match value {
                    Value::Object(child) => {
                        let resolved = self.key_resolver.resolve(&KeyContext {
                            typename: None,
                            object: child,
                            parent_key: record_key,
                            parent_field: &field_key,
                        });
                        if let Some(child_key) = resolved {
                            self.normalize_object(&child_key, child_shape, child, records);
                            record.insert_field(field_key, FieldValue::Reference(child_key));
                        } else {
                            self.normalize_fields(
                                record_key, &field_key, child_shape, child, record, records,
                            );
                        }
                    }
                    // Null or shape-mismatched data is stored verbatim.
                    _ => record.insert_field(field_key, FieldValue::from_json(value)),
                },
                SelectionKind::List(element) => match value {
                    Value::Array(items) => {
                        let list = items
                            .iter()
                            .enumerate()
                            .map(|(index, item)| {
                                self.normalize_element(
                                    record_key, &field_key, index, element, item, records,
                                )
                            })
                            .collect();
                        record.insert_field(field_key, FieldValue::List(list));
                    }
                    _ => record.insert_field(field_key, FieldValue::from_json(value)),
                },
            }
        }
    }

    fn normalize_element(
        &self,
        parent_key: &CacheKey,
        field_key: &str,
        index: usize,
        kind: &SelectionKind,
        value: &Value,
        records: &mut RecordSet,
    ) -> FieldValue {
        match kind {
            SelectionKind::Scalar => FieldValue::from_json(value),
            SelectionKind::Object(shape) => match value {
                Value::Object(child) => {
                    let resolved = self.key_resolver.resolve(&KeyContext {
                        typename: None,
                        object: child,
                        parent_key,
                        parent_field: field_key,
                    });
                    // List elements cannot be flattened into the parent, so
                    // identity-less ones get a structural fallback key.
                    let child_key = resolved.unwrap_or_else(|| {
                        CacheKey::structural(parent_key, &format!("{field_key}.{index}"))
                    });
                    self.normalize_object(&child_key, shape, child, records);
                    FieldValue::Reference(child_key)
                }
                _ => FieldValue::from_json(value),
            },
            SelectionKind::List(inner) => match value {
                Value::Array(items) => FieldValue::List(
                    items
                        .iter()
                        .enumerate()
                        .map(|(inner_index, item)| {
                            self.normalize_element(
                                parent_key,
                                &format!("{field_key}.{index}"),
                                inner_index,
                                inner,
                                item,
                                records,
                            )
                        })
                        .collect(),
                ),
                _ => FieldValue::from_json(value),
            },
        }
    }
}

fn compose(prefix: &str, field_key: &str) -> String {
    if prefix.is_empty() {
        field_key.to_string()
    } else {
        format!("{prefix}.{field_key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_api::TypePolicyResolver;
    use serde_json::json;

    fn user_shape() -> ObjectShape {
        ObjectShape::new(vec![
            Selection::scalar("__typename"),
            Selection::scalar("id"),
            Selection::scalar("name"),
        ])
    }

    #[test]
    fn test_normalize_keyed_object_produces_reference() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let shape = ObjectShape::new(vec![Selection::object("user", user_shape())]);
        let data = json!({
            "user": {"__typename": "User", "id": "42", "name": "Ada"}
        });

        let records = normalizer.normalize(CacheKey::query_root(), &shape, &data);
        assert_eq!(records.len(), 2);

        let root = records.get(&CacheKey::query_root()).unwrap();
        assert_eq!(
            root.field("user"),
            Some(&FieldValue::Reference(CacheKey::new("User:42")))
        );
        let user = records.get(&CacheKey::new("User:42")).unwrap();
        assert_eq!(user.field("name"), Some(&FieldValue::String("Ada".into())));
    }

    #[test]
    fn test_normalize_field_with_arguments_uses_serialized_key() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let shape = ObjectShape::new(vec![
            Selection::object("user", user_shape()).with_argument("id", json!(42))
        ]);
        let data = json!({
            "user": {"__typename": "User", "id": "42", "name": "Ada"}
        });

        let records = normalizer.normalize(CacheKey::query_root(), &shape, &data);
        let root = records.get(&CacheKey::query_root()).unwrap();
        assert!(root.field("user(id:42)").is_some());
        assert!(root.field("user").is_none());
    }

    #[test]
    fn test_normalize_under_operation_root_key() {
        // Named operations root their records under a key derived from the
        // operation name and its variables.
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let mut variables = std::collections::BTreeMap::new();
        variables.insert("id".to_string(), json!(42));
        let root = CacheKey::operation("GetUser", &variables);
        assert_eq!(root.as_str(), "GetUser(id:42)");

        let shape = ObjectShape::new(vec![Selection::object("user", user_shape())]);
        let data = json!({
            "user": {"__typename": "User", "id": "42", "name": "Ada"}
        });
        let records = normalizer.normalize(root.clone(), &shape, &data);
        assert_eq!(
            records.get(&root).unwrap().field("user"),
            Some(&FieldValue::Reference(CacheKey::new("User:42")))
        );
    }

    #[test]
    fn test_normalize_keyless_object_is_flattened_inline() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let price = ObjectShape::new(vec![
            Selection::scalar("amount"),
            Selection::scalar("currency"),
        ]);
        let shape = ObjectShape::new(vec![Selection::object("price", price)]);
        let data = json!({"price": {"amount": 10, "currency": "EUR"}});

        let records = normalizer.normalize(CacheKey::new("Order:1"), &shape, &data);
        assert_eq!(records.len(), 1);
        let order = records.get(&CacheKey::new("Order:1")).unwrap();
        assert_eq!(
            order.field("price.amount"),
            Some(&FieldValue::Number(10.into()))
        );
        assert_eq!(
            order.field("price.currency"),
            Some(&FieldValue::String("EUR".into()))
        );
    }

    #[test]
    fn test_normalize_list_of_keyed_objects() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let shape = ObjectShape::new(vec![Selection::list_of_objects("friends", user_shape())]);
        let data = json!({
            "friends": [
                {"__typename": "User", "id": "1", "name": "A"},
                {"__typename": "User", "id": "2", "name": "B"}
            ]
        });

        let records = normalizer.normalize(CacheKey::new("User:0"), &shape, &data);
        let root = records.get(&CacheKey::new("User:0")).unwrap();
        assert_eq!(
            root.field("friends"),
            Some(&FieldValue::List(vec![
                FieldValue::Reference(CacheKey::new("User:1")),
                FieldValue::Reference(CacheKey::new("User:2")),
            ]))
        );
        assert!(records.get(&CacheKey::new("User:2")).is_some());
    }

    #[test]
    fn test_normalize_keyless_list_elements_get_structural_keys() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let entry = ObjectShape::new(vec![Selection::scalar("label")]);
        let shape = ObjectShape::new(vec![Selection::list_of_objects("entries", entry)]);
        let data = json!({"entries": [{"label": "x"}, {"label": "y"}]});

        let records = normalizer.normalize(CacheKey::query_root(), &shape, &data);
        assert_eq!(records.len(), 3);
        let first = records.get(&CacheKey::new("QUERY_ROOT.entries.0")).unwrap();
        assert_eq!(first.field("label"), Some(&FieldValue::String("x".into())));
    }

    #[test]
    fn test_normalize_missing_fields_are_skipped() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let shape = ObjectShape::new(vec![Selection::scalar("name"), Selection::scalar("age")]);
        let data = json!({"name": "Ada"});

        let records = normalizer.normalize(CacheKey::new("User:1"), &shape, &data);
        let user = records.get(&CacheKey::new("User:1")).unwrap();
        assert!(user.field("name").is_some());
        assert!(user.field("age").is_none());
    }

    #[test]
    fn test_normalize_self_reference_folds_into_one_record() {
        // User:42 whose friend is User:42 again - both subtrees fold into
        // a single record with a self-reference.
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let friend = ObjectShape::new(vec![Selection::scalar("__typename"), Selection::scalar("id")]);
        let shape = ObjectShape::new(vec![
            Selection::scalar("__typename"),
            Selection::scalar("id"),
            Selection::scalar("name"),
            Selection::object("friend", friend),
        ]);
        let data = json!({
            "__typename": "User", "id": "42", "name": "Ada",
            "friend": {"__typename": "User", "id": "42"}
        });

        // The root object itself is keyed, so normalize under its own key.
        let records = normalizer.normalize(CacheKey::new("User:42"), &shape, &data);
        assert_eq!(records.len(), 1);
        let user = records.get(&CacheKey::new("User:42")).unwrap();
        assert_eq!(
            user.field("friend"),
            Some(&FieldValue::Reference(CacheKey::new("User:42")))
        );
        assert_eq!(user.field("name"), Some(&FieldValue::String("Ada".into())));
    }

    #[test]
    fn test_normalize_null_object_field_stored_as_null() {
        let resolver = TypePolicyResolver::new();
        let normalizer = Normalizer::new(&resolver);
        let shape = ObjectShape::new(vec![Selection::object("user", user_shape())]);
        let data = json!({"user": null});

        let records = normalizer.normalize(CacheKey::query_root(), &shape, &data);
        let root = records.get(&CacheKey::query_root()).unwrap();
        assert_eq!(root.field("user"), Some(&FieldValue::Null));
    }
}
