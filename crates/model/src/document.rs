use std::collections::BTreeMap;

use crate::value::Value;

/// A key/value pair inside a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub key: String,
    pub value: Value,
}

impl Element {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A document: an id unique within its collection plus an ordered element
/// list.
///
/// Element order is preserved through serialization, but equality is
/// structural per key: two documents with the same id and the same key → value
/// mapping compare equal regardless of element order.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: String,
    pub elements: Vec<Element>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: Vec::new(),
        }
    }

    /// Builder-style append, mostly for tests and fixtures.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.elements.push(Element::new(key, value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.elements.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Overwrite the element with `key` or append a new one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.elements.iter_mut().find(|e| e.key == key) {
            Some(elem) => elem.value = value,
            None => self.elements.push(Element { key, value }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.elements.iter().position(|e| e.key == key)?;
        Some(self.elements.remove(pos).value)
    }

    fn keyed(&self) -> BTreeMap<&str, &Value> {
        self.elements
            .iter()
            .map(|e| (e.key.as_str(), &e.value))
            .collect()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.keyed() == other.keyed()
    }
}
