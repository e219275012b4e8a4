//! Records: ordered field maps with nested-path helpers.

use std::collections::BTreeMap;

use crate::model::Value;

/// A structured record: field name to value.
///
/// Nested objects are stored as `Value::Object`; dotted paths can be used
/// to reach into them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Looks up a dotted path (`"address.city"`), descending through objects.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(r) => r.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Inserts a value at a nested path, creating intermediate objects.
    ///
    /// A non-object value in the way is replaced.
    pub fn insert_path(&mut self, path: &[String], value: Value) {
        match path {
            [] => {}
            [leaf] => {
                self.fields.insert(leaf.clone(), value);
            }
            [head, rest @ ..] => {
                let entry = self
                    .fields
                    .entry(head.clone())
                    .or_insert_with(|| Value::Object(Record::new()));
                if !matches!(entry, Value::Object(_)) {
                    *entry = Value::Object(Record::new());
                }
                if let Value::Object(inner) = entry {
                    inner.insert_path(rest, value);
                }
            }
        }
    }

    /// Whether a nested path already holds a value.
    pub fn contains_path(&self, path: &[String]) -> bool {
        let mut current = self;
        for (i, segment) in path.iter().enumerate() {
            match current.fields.get(segment) {
                None => return false,
                Some(_) if i + 1 == path.len() => return true,
                Some(Value::Object(inner)) => current = inner,
                Some(_) => return false,
            }
        }
        false
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
