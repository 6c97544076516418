use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{document::Document, value::Value};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Timestamp,
    Bytes,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::String, Value::String(_))
                | (FieldType::Number, Value::Number(_))
                | (FieldType::Bool, Value::Bool(_))
                | (FieldType::Timestamp, Value::Timestamp(_))
                | (FieldType::Bytes, Value::Bytes(_))
                | (FieldType::Object, Value::Elements(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
}

/// `field` must hold the id of a document in `references_collection`.
/// `references_field` names the field that id is mirrored from, for
/// introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub field: String,
    pub references_collection: String,
    pub references_field: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("required field `{0}` is missing")]
    MissingField(String),
    #[error("field `{field}` expected type {expected:?}, found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
}

/// A collection schema: typed fields, an optional (possibly composite)
/// primary key, and foreign keys into other collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldSchema>,
    primary_key: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        required: bool,
        unique: bool,
    ) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            required,
            unique,
        });
        self
    }

    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn foreign_key(
        mut self,
        field: impl Into<String>,
        references_collection: impl Into<String>,
        references_field: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.into(),
            references_collection: references_collection.into(),
            references_field: references_field.into(),
        });
        self
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn primary_key_fields(&self) -> &[String] {
        &self.primary_key
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Pure type and required-presence validation. Constraint checks that
    /// need storage state (PK/FK/UNIQUE) live with the collection.
    pub fn validate(&self, doc: &Document) -> Result<(), SchemaError> {
        for field in &self.fields {
            match doc.get(&field.name) {
                None => {
                    if field.required {
                        return Err(SchemaError::MissingField(field.name.clone()));
                    }
                }
                Some(Value::Null) => {
                    if field.required {
                        return Err(SchemaError::MissingField(field.name.clone()));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        return Err(SchemaError::TypeMismatch {
                            field: field.name.clone(),
                            expected: field.field_type,
                            found: value.type_name(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
