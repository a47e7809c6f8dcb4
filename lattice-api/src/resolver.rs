//! Key and value resolution strategies.
//!
//! Both strategies are injected at store construction and resolved through
//! trait objects, never inheritance. They must be pure functions of their
//! inputs so that normalization and denormalization agree on object
//! identity.

use crate::record::{CacheKey, FieldKey, FieldValue, Record};
use crate::shape::{FieldPath, Selection};
use std::collections::HashMap;

/// Everything known about an object at the moment a cache key is needed:
/// its typename (if declared), the fields seen so far, and where it hangs
/// off its parent.
#[derive(Debug)]
pub struct KeyContext<'a> {
    /// Declared typename, when the shape carries one.
    pub typename: Option<&'a str>,
    /// The object's fields as received.
    pub object: &'a serde_json::Map<String, serde_json::Value>,
    /// The key of the record this object was reached from.
    pub parent_key: &'a CacheKey,
    /// The field (on the parent) this object was reached through.
    pub parent_field: &'a str,
}

/// Decides the stable cache key for an object, or `None` when the object
/// has no identity and should be embedded in its parent instead of being
/// normalized into its own record.
///
/// Implementations must be pure: no I/O, no mutation.
pub trait CacheKeyResolver: Send + Sync {
    /// Resolve a key for the object described by `ctx`.
    fn resolve(&self, ctx: &KeyContext<'_>) -> Option<CacheKey>;
}

/// The built-in resolver: a type-policy table mapping typename to the name
/// of its identity field.
///
/// The typename comes from the context when the shape declares one, falling
/// back to a `__typename` field in the object itself. Objects without a
/// typename, or without a value for their identity field, get no key and
/// are embedded inline.
#[derive(Debug, Clone)]
pub struct TypePolicyResolver {
    policies: HashMap<String, String>,
    default_id_field: Option<String>,
}

impl TypePolicyResolver {
    /// A resolver with no explicit policies that keys any typed object by
    /// its `id` field.
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            default_id_field: Some("id".to_string()),
        }
    }

    /// Register an identity field for a typename.
    pub fn with_policy(mut self, typename: &str, id_field: &str) -> Self {
        self.policies
            .insert(typename.to_string(), id_field.to_string());
        self
    }

    /// Disable the implicit `id` fallback; only typenames with an explicit
    /// policy get keys.
    pub fn without_default_id_field(mut self) -> Self {
        self.default_id_field = None;
        self
    }
}

impl Default for TypePolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKeyResolver for TypePolicyResolver {
    fn resolve(&self, ctx: &KeyContext<'_>) -> Option<CacheKey> {
        let typename = ctx
            .typename
            .or_else(|| ctx.object.get("__typename").and_then(|v| v.as_str()))?;
        let id_field = self
            .policies
            .get(typename)
            .map(String::as_str)
            .or(self.default_id_field.as_deref())?;
        let id = match ctx.object.get(id_field)? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(CacheKey::from_typename_id(typename, &id))
    }
}

/// Context handed to a [`CacheResolver`] before the literal field lookup.
#[derive(Debug)]
pub struct FieldContext<'a> {
    /// The record the field is being read from.
    pub record: &'a Record,
    /// The selection being resolved.
    pub selection: &'a Selection,
    /// The field key about to be looked up.
    pub field_key: &'a FieldKey,
    /// The path of the field within the ongoing read.
    pub path: &'a FieldPath,
}

/// Read-side hook allowing computed or derived reads (e.g. pagination
/// helpers that synthesize a field from other records) to intercept before
/// the literal stored-field lookup.
///
/// Returning `None` falls through to the stored value.
pub trait CacheResolver: Send + Sync {
    /// Resolve a field value, or `None` to use the stored one.
    fn resolve_field(&self, ctx: &FieldContext<'_>) -> Option<FieldValue>;
}

/// The default resolver: always fall through to the literal stored field.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralCacheResolver;

impl CacheResolver for LiteralCacheResolver {
    fn resolve_field(&self, _ctx: &FieldContext<'_>) -> Option<FieldValue> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_type_policy_resolver_uses_default_id_field() {
        let resolver = TypePolicyResolver::new();
        let parent = CacheKey::query_root();
        let obj = object(json!({"__typename": "User", "id": "42"}));
        let key = resolver.resolve(&KeyContext {
            typename: None,
            object: &obj,
            parent_key: &parent,
            parent_field: "user",
        });
        assert_eq!(key, Some(CacheKey::new("User:42")));
    }

    #[test]
    fn test_type_policy_resolver_numeric_id() {
        let resolver = TypePolicyResolver::new();
        let parent = CacheKey::query_root();
        let obj = object(json!({"id": 7}));
        let key = resolver.resolve(&KeyContext {
            typename: Some("Post"),
            object: &obj,
            parent_key: &parent,
            parent_field: "post",
        });
        assert_eq!(key, Some(CacheKey::new("Post:7")));
    }

    #[test]
    fn test_type_policy_resolver_explicit_policy_wins() {
        let resolver = TypePolicyResolver::new().with_policy("Book", "isbn");
        let parent = CacheKey::query_root();
        let obj = object(json!({"__typename": "Book", "id": "wrong", "isbn": "978"}));
        let key = resolver.resolve(&KeyContext {
            typename: None,
            object: &obj,
            parent_key: &parent,
            parent_field: "book",
        });
        assert_eq!(key, Some(CacheKey::new("Book:978")));
    }

    #[test]
    fn test_type_policy_resolver_no_identity_returns_none() {
        let resolver = TypePolicyResolver::new();
        let parent = CacheKey::query_root();
        // No typename at all: value object, embed inline.
        let obj = object(json!({"amount": 10, "currency": "EUR"}));
        let key = resolver.resolve(&KeyContext {
            typename: None,
            object: &obj,
            parent_key: &parent,
            parent_field: "price",
        });
        assert_eq!(key, None);
    }

    #[test]
    fn test_type_policy_resolver_without_default_requires_policy() {
        let resolver = TypePolicyResolver::new().without_default_id_field();
        let parent = CacheKey::query_root();
        let obj = object(json!({"__typename": "User", "id": "42"}));
        let key = resolver.resolve(&KeyContext {
            typename: None,
            object: &obj,
            parent_key: &parent,
            parent_field: "user",
        });
        assert_eq!(key, None);
    }

    #[test]
    fn test_literal_cache_resolver_falls_through() {
        let record = Record::new("User:1");
        let selection = Selection::scalar("name");
        let field_key = selection.field_key();
        let path = FieldPath::root();
        let resolved = LiteralCacheResolver.resolve_field(&FieldContext {
            record: &record,
            selection: &selection,
            field_key: &field_key,
            path: &path,
        });
        assert!(resolved.is_none());
    }
}
