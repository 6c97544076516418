//! Binary document codec.
//!
//! Layout: `id | element_count:u32 | element*`, where each element is
//! `key | tag:u8 | value`. Strings and byte buffers are u64-length-prefixed.
//! Nested element lists carry a u32 count followed by their element records.

use crate::{
    buffer::{self, BufReader, BufWriter, CountWriter, DecodeError},
    document::{Document, Element},
    value::{Timestamp, Value},
};

const TAG_NULL: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_TIMESTAMP: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ELEMENTS: u8 = 6;

/// Encode `doc` to bytes. The inverse of [`deserialize_document`].
pub fn serialize_document(doc: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    write_document(&mut out, doc);
    out
}

/// Number of bytes [`serialize_document`] would produce, without allocating.
pub fn encoded_len(doc: &Document) -> usize {
    let mut counter = CountWriter::new();
    write_document(&mut counter, doc);
    counter.len()
}

/// Reconstruct a document from the bytes produced by [`serialize_document`].
pub fn deserialize_document(bytes: &[u8]) -> Result<Document, DecodeError> {
    let mut buf = bytes;
    let doc = read_document(&mut buf)?;
    Ok(doc)
}

fn write_document(out: &mut impl BufWriter, doc: &Document) {
    buffer::put_str(out, &doc.id);
    write_elements(out, &doc.elements);
}

fn read_document<'de>(buf: &mut impl BufReader<'de>) -> Result<Document, DecodeError> {
    let id = buffer::get_str(buf)?;
    let elements = read_elements(buf)?;
    Ok(Document { id, elements })
}

fn write_elements(out: &mut impl BufWriter, elements: &[Element]) {
    out.put_u32(elements.len() as u32);
    for element in elements {
        buffer::put_str(out, &element.key);
        write_value(out, &element.value);
    }
}

fn read_elements<'de>(buf: &mut impl BufReader<'de>) -> Result<Vec<Element>, DecodeError> {
    let count = buf.get_u32()?;
    let mut elements = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let key = buffer::get_str(buf)?;
        let value = read_value(buf)?;
        elements.push(Element { key, value });
    }
    Ok(elements)
}

fn write_value(out: &mut impl BufWriter, value: &Value) {
    match value {
        Value::Null => out.put_u8(TAG_NULL),
        Value::String(s) => {
            out.put_u8(TAG_STRING);
            buffer::put_str(out, s);
        }
        Value::Number(n) => {
            out.put_u8(TAG_NUMBER);
            out.put_f64(*n);
        }
        Value::Bool(b) => {
            out.put_u8(TAG_BOOL);
            out.put_u8(*b as u8);
        }
        Value::Timestamp(ts) => {
            out.put_u8(TAG_TIMESTAMP);
            out.put_i64(ts.as_micros());
        }
        Value::Bytes(bytes) => {
            out.put_u8(TAG_BYTES);
            buffer::put_bytes(out, bytes);
        }
        Value::Elements(elements) => {
            out.put_u8(TAG_ELEMENTS);
            write_elements(out, elements);
        }
    }
}

fn read_value<'de>(buf: &mut impl BufReader<'de>) -> Result<Value, DecodeError> {
    let tag = buf.get_u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_STRING => Value::String(buffer::get_str(buf)?),
        TAG_NUMBER => Value::Number(buf.get_f64()?),
        TAG_BOOL => Value::Bool(buf.get_u8()? != 0),
        TAG_TIMESTAMP => Value::Timestamp(Timestamp::from_micros(buf.get_i64()?)),
        TAG_BYTES => Value::Bytes(buffer::get_bytes(buf)?),
        TAG_ELEMENTS => Value::Elements(read_elements(buf)?),
        tag => return Err(DecodeError::InvalidTag { tag, kind: "value" }),
    })
}
