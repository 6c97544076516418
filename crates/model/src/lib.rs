pub mod buffer;
pub mod document;
pub mod schema;
pub mod ser;
pub mod value;

pub use crate::{
    buffer::{BufReader, BufWriter, DecodeError},
    document::{Document, Element},
    schema::{FieldSchema, FieldType, ForeignKey, Schema, SchemaError},
    ser::{deserialize_document, encoded_len, serialize_document},
    value::{Timestamp, Value},
};
