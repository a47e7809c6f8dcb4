//! Typed-shape interface consumed from the compiler/runtime.
//!
//! A compiled query knows how to visit its own shape: for each declared
//! field, whether it is a scalar, a nested object, or a list, and the field
//! key including serialized arguments. The normalization and
//! denormalization core depends only on this interface, never on generated
//! code internals.
//!
//! Object shapes are shared via `Arc`, so recursive shapes (a `friend`
//! field reusing its enclosing shape) are representable. That is why the
//! reader carries an explicit cycle guard.

use crate::record::{field_key, FieldKey};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The kind of value a selection produces.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionKind {
    /// A scalar or enum leaf.
    Scalar,
    /// A nested object with its own selections.
    Object(Arc<ObjectShape>),
    /// A list; each element has the inner kind.
    List(Box<SelectionKind>),
}

/// One declared field of an object shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The response field name.
    pub name: String,
    /// Field arguments; sorted by construction so field keys are stable.
    pub arguments: BTreeMap<String, Value>,
    /// What this selection produces.
    pub kind: SelectionKind,
}

impl Selection {
    /// A scalar leaf selection.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
            kind: SelectionKind::Scalar,
        }
    }

    /// A nested object selection.
    pub fn object(name: impl Into<String>, shape: ObjectShape) -> Self {
        Self::object_shared(name, Arc::new(shape))
    }

    /// A nested object selection reusing a shared shape. This is the
    /// constructor that makes recursive shapes possible.
    pub fn object_shared(name: impl Into<String>, shape: Arc<ObjectShape>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
            kind: SelectionKind::Object(shape),
        }
    }

    /// A list selection over the given element kind.
    pub fn list(name: impl Into<String>, element: SelectionKind) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
            kind: SelectionKind::List(Box::new(element)),
        }
    }

    /// A list-of-objects selection, the common case.
    pub fn list_of_objects(name: impl Into<String>, shape: ObjectShape) -> Self {
        Self::list(name, SelectionKind::Object(Arc::new(shape)))
    }

    /// Attach an argument. Arguments participate in the field key.
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    /// The field key for this selection: name plus deterministically
    /// serialized arguments.
    pub fn field_key(&self) -> FieldKey {
        field_key(&self.name, &self.arguments)
    }
}

/// The shape of one object: its declared selections, in response order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectShape {
    /// Declared fields.
    pub selections: Vec<Selection>,
}

impl ObjectShape {
    /// Create a shape from its selections.
    pub fn new(selections: Vec<Selection>) -> Self {
        Self { selections }
    }
}

/// A dotted path to a field inside a read, used for cache-miss diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Extend the path with a field name.
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// Extend the path with a list index.
    pub fn index(&self, index: usize) -> Self {
        self.child(&index.to_string())
    }

    /// The path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("$")
        } else {
            f.write_str(&self.0.join("."))
        }
    }
}
