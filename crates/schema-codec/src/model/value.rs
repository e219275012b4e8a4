//! Dynamic values written to and read from nodes.

use std::collections::BTreeMap;

use crate::model::Record;

/// Engine-assigned node identifier.
pub type NodeId = u32;

/// Compiled type identifier.
pub type TypeId = u16;

/// Handle to a node whose create has not been acknowledged by the engine.
///
/// Obtained from [`Modifier::create`](crate::modify::Modifier::create) and
/// resolved through the modifier that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(pub(crate) u64);

impl PendingId {
    /// Raw handle value, unique per modifier.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A node addressed either by its real id or by a pending create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Id(NodeId),
    Pending(PendingId),
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Id(id)
    }
}

impl From<PendingId> for NodeRef {
    fn from(id: PendingId) -> Self {
        NodeRef::Pending(id)
    }
}

/// A reference with optional edge properties.
#[derive(Debug, Clone, PartialEq)]
pub struct RefValue {
    pub target: NodeRef,
    /// Edge properties, keyed by edge property name (without `$`).
    pub edges: Record,
}

impl RefValue {
    pub fn new(target: impl Into<NodeRef>) -> Self {
        Self {
            target: target.into(),
            edges: Record::new(),
        }
    }

    pub fn with_edges(target: impl Into<NodeRef>, edges: Record) -> Self {
        Self {
            target: target.into(),
            edges,
        }
    }
}

/// Changes to a reference collection.
///
/// `set` replaces the whole collection; `add` and `delete` patch it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefsUpdate {
    pub set: Option<Vec<RefValue>>,
    pub add: Vec<RefValue>,
    pub delete: Vec<NodeRef>,
}

impl RefsUpdate {
    pub fn set(items: impl IntoIterator<Item = RefValue>) -> Self {
        Self {
            set: Some(items.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn add(items: impl IntoIterator<Item = RefValue>) -> Self {
        Self {
            add: items.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn delete(items: impl IntoIterator<Item = NodeRef>) -> Self {
        Self {
            delete: items.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// A dynamically typed value.
///
/// The same enum is used for write input and decoded output. Input-only
/// variants (`Ref`, `Refs`) carry targets; decoded references come back as
/// `Object` (single) or `List` of `Object` (collection).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent. Deletes a field on update; marks a requested but missing
    /// field in decoded output.
    Null,
    Bool(bool),
    /// Integers, timestamps (milliseconds) and node ids.
    Int(i64),
    Float(f64),
    /// Strings, aliases and enum labels.
    String(String),
    Binary(Vec<u8>),
    /// Localized text, keyed by locale code.
    Text(BTreeMap<String, String>),
    Vector(Vec<f32>),
    Ref(RefValue),
    Refs(RefsUpdate),
    Object(Record),
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Text(_) => "text",
            Value::Vector(_) => "vector",
            Value::Ref(_) => "reference",
            Value::Refs(_) => "references",
            Value::Object(_) => "object",
            Value::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

impl From<PendingId> for Value {
    fn from(v: PendingId) -> Self {
        Value::Ref(RefValue::new(v))
    }
}

impl From<RefValue> for Value {
    fn from(v: RefValue) -> Self {
        Value::Ref(v)
    }
}

impl From<RefsUpdate> for Value {
    fn from(v: RefsUpdate) -> Self {
        Value::Refs(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Object(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_int_accepts_integral_floats() {
        assert_eq!(Value::Float(4.0).as_int(), Some(4));
        assert_eq!(Value::Float(4.5).as_int(), None);
        assert_eq!(Value::Int(-3).as_int(), Some(-3));
        assert_eq!(Value::String("3".into()).as_int(), None);
    }

    #[test]
    fn test_pending_converts_to_reference() {
        let v: Value = PendingId(7).into();
        assert_eq!(v, Value::Ref(RefValue::new(NodeRef::Pending(PendingId(7)))));
    }
}
