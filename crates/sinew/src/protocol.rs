//! Wire framing.
//!
//! A parameterized request is one message, all integers big-endian:
//!
//! ```text
//! total_len:u32 | query_len:u32 | query | param_count:u8 | param*
//! param = type:u8 | value_len:u32 | value
//! ```
//!
//! A plain request frames the bare query text: `total_len:u32 | query`.
//! Responses are `body_len:u32 | body`, body being a free-form string.

use std::io::{Read, Write};

use crate::error::SinewError;

/// Hard cap on response bodies; larger framing kills the connection.
pub const MAX_RESPONSE_SIZE: u32 = 10 * 1024 * 1024;
/// Requests are capped the same way on the server side.
pub const MAX_REQUEST_SIZE: u32 = 10 * 1024 * 1024;
/// A request carries at most this many parameters.
pub const MAX_PARAMS: usize = 255;

const TYPE_NULL: u8 = 0x00;
const TYPE_STRING: u8 = 0x01;
const TYPE_INT64: u8 = 0x02;
const TYPE_FLOAT64: u8 = 0x03;
const TYPE_BOOL: u8 = 0x04;

/// One typed positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Param {
    /// Render as a TissQL literal, for the deprecated client-side
    /// substitution path. Strings double their quotes; nothing else is
    /// escaped, which is exactly why that path is deprecated.
    pub fn to_query_literal(&self) -> String {
        match self {
            Param::Null => "NULL".to_owned(),
            Param::Str(s) => format!("'{}'", s.replace('\'', "''")),
            Param::Int(i) => i.to_string(),
            Param::Float(f) => f.to_string(),
            Param::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
        }
    }
}

impl From<()> for Param {
    fn from(_: ()) -> Self {
        Param::Null
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Str(v.to_owned())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Str(v)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Param::Null, Into::into)
    }
}

/// A decoded request, as the server sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub query: String,
    pub params: Vec<Param>,
}

/// A query result: the raw response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply(String);

impl Reply {
    pub(crate) fn new(body: String) -> Self {
        Self(body)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Frame a bare query string.
pub fn encode_plain(query: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + query.len());
    out.extend_from_slice(&(query.len() as u32).to_be_bytes());
    out.extend_from_slice(query.as_bytes());
    out
}

/// Frame a query with typed positional parameters.
pub fn encode_with_params(query: &str, params: &[Param]) -> Result<Vec<u8>, SinewError> {
    if params.len() > MAX_PARAMS {
        return Err(SinewError::TooManyParams(MAX_PARAMS));
    }

    let mut body = Vec::with_capacity(4 + query.len() + 1 + params.len() * 6);
    body.extend_from_slice(&(query.len() as u32).to_be_bytes());
    body.extend_from_slice(query.as_bytes());
    body.push(params.len() as u8);

    for param in params {
        match param {
            Param::Null => {
                body.push(TYPE_NULL);
                body.extend_from_slice(&0u32.to_be_bytes());
            }
            Param::Str(s) => {
                body.push(TYPE_STRING);
                body.extend_from_slice(&(s.len() as u32).to_be_bytes());
                body.extend_from_slice(s.as_bytes());
            }
            Param::Int(i) => {
                body.push(TYPE_INT64);
                body.extend_from_slice(&8u32.to_be_bytes());
                body.extend_from_slice(&i.to_be_bytes());
            }
            Param::Float(f) => {
                body.push(TYPE_FLOAT64);
                body.extend_from_slice(&8u32.to_be_bytes());
                body.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Param::Bool(b) => {
                body.push(TYPE_BOOL);
                body.extend_from_slice(&1u32.to_be_bytes());
                body.push(*b as u8);
            }
        }
    }

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a request body (everything after the outer length prefix).
///
/// The plain and parameterized framings share the outer shape, so this
/// first tries the parameterized layout and falls back to treating the
/// whole body as query text. Query text never parses as a parameterized
/// frame by accident: its first four bytes would have to spell a length
/// that exactly fits the body.
pub fn decode_request(body: &[u8]) -> Request {
    if let Some(request) = try_decode_params(body) {
        return request;
    }
    Request {
        query: String::from_utf8_lossy(body).into_owned(),
        params: Vec::new(),
    }
}

fn try_decode_params(body: &[u8]) -> Option<Request> {
    if body.len() < 5 {
        return None;
    }
    let query_len = u32::from_be_bytes(body[..4].try_into().ok()?) as usize;
    let mut pos = 4usize.checked_add(query_len)?;
    if pos >= body.len() {
        return None;
    }
    let query = std::str::from_utf8(&body[4..pos]).ok()?.to_owned();

    let param_count = body[pos];
    pos += 1;
    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        if pos + 5 > body.len() {
            return None;
        }
        let type_tag = body[pos];
        let value_len =
            u32::from_be_bytes(body[pos + 1..pos + 5].try_into().ok()?) as usize;
        pos += 5;
        if pos + value_len > body.len() {
            return None;
        }
        let value = &body[pos..pos + value_len];
        pos += value_len;
        params.push(match (type_tag, value_len) {
            (TYPE_NULL, 0) => Param::Null,
            (TYPE_STRING, _) => Param::Str(std::str::from_utf8(value).ok()?.to_owned()),
            (TYPE_INT64, 8) => Param::Int(i64::from_be_bytes(value.try_into().ok()?)),
            (TYPE_FLOAT64, 8) => {
                Param::Float(f64::from_bits(u64::from_be_bytes(value.try_into().ok()?)))
            }
            (TYPE_BOOL, 1) => Param::Bool(value[0] != 0),
            _ => return None,
        });
    }
    // Trailing garbage means this was not a parameterized frame after all.
    if pos != body.len() {
        return None;
    }
    Some(Request { query, params })
}

/// Read one `len:u32 | payload` frame. `Ok(None)` is a clean EOF before the
/// header.
pub fn read_frame(
    stream: &mut impl Read,
    max_len: u32,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match read_exact_or_eof(stream, &mut header)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_be_bytes(header);
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_len} byte limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Write one `len:u32 | payload` response frame.
pub fn write_frame(stream: &mut impl Write, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_exact_or_eof(stream: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}
