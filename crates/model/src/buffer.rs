//! Minimal big-endian read/write traits over byte buffers.
//!
//! Every on-disk and wire codec in TissDB goes through these traits, so all
//! bounds checking lives in one place. Reads never panic; running off the end
//! of the input yields [`DecodeError::BufferLength`].

use thiserror::Error;

/// Strings read through [`get_str`] may not exceed this many bytes.
pub const MAX_STRING_LEN: u64 = 10 * 1024 * 1024;
/// Byte buffers read through [`get_bytes`] may not exceed this many bytes.
pub const MAX_BYTES_LEN: u64 = 100 * 1024 * 1024;

/// Error returned when decoding from a buffer fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer has insufficient data: needed {needed} bytes, {have} available")]
    BufferLength { needed: usize, have: usize },
    #[error("unknown tag {tag:#04x} for {kind}")]
    InvalidTag { tag: u8, kind: &'static str },
    #[error("string is not valid UTF-8")]
    Utf8,
    #[error("string length {len} exceeds the {max} byte limit")]
    StringTooLong { len: u64, max: u64 },
    #[error("byte buffer length {len} exceeds the {max} byte limit")]
    BytesTooLong { len: u64, max: u64 },
    #[error("bad signature in {kind} header")]
    BadSignature { kind: &'static str },
}

/// A sink for encoding. All multi-byte integers are written big-endian.
pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&[val]);
    }
    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_be_bytes());
    }
    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_be_bytes());
    }
    fn put_u64(&mut self, val: u64) {
        self.put_slice(&val.to_be_bytes());
    }
    fn put_i64(&mut self, val: i64) {
        self.put_slice(&val.to_be_bytes());
    }
    fn put_f64(&mut self, val: f64) {
        self.put_u64(val.to_bits());
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

/// A writer that only counts bytes. Used for size accounting without
/// materializing an encoding.
#[derive(Default)]
pub struct CountWriter {
    len: usize,
}

impl CountWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl BufWriter for CountWriter {
    fn put_slice(&mut self, slice: &[u8]) {
        self.len += slice.len();
    }
}

/// A source for decoding. All multi-byte integers are read big-endian.
pub trait BufReader<'de> {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError>;
    fn remaining(&self) -> usize;

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.get_slice(1)?[0])
    }
    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.get_array()?))
    }
    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.get_array()?))
    }
    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.get_array()?))
    }
    fn get_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.get_array()?))
    }
    fn get_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.get_u64()?))
    }
    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.get_slice(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }
}

impl<'de> BufReader<'de> for &'de [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError> {
        if self.len() < size {
            return Err(DecodeError::BufferLength {
                needed: size,
                have: self.len(),
            });
        }
        let (ret, rest) = self.split_at(size);
        *self = rest;
        Ok(ret)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

/// Write a u64-length-prefixed UTF-8 string.
pub fn put_str(out: &mut impl BufWriter, s: &str) {
    out.put_u64(s.len() as u64);
    out.put_slice(s.as_bytes());
}

/// Read a u64-length-prefixed UTF-8 string, bounded by [`MAX_STRING_LEN`].
pub fn get_str<'de>(buf: &mut impl BufReader<'de>) -> Result<String, DecodeError> {
    let len = buf.get_u64()?;
    if len > MAX_STRING_LEN {
        return Err(DecodeError::StringTooLong {
            len,
            max: MAX_STRING_LEN,
        });
    }
    let bytes = buf.get_slice(len as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
}

/// Write a u64-length-prefixed byte buffer.
pub fn put_bytes(out: &mut impl BufWriter, bytes: &[u8]) {
    out.put_u64(bytes.len() as u64);
    out.put_slice(bytes);
}

/// Read a u64-length-prefixed byte buffer, bounded by [`MAX_BYTES_LEN`].
pub fn get_bytes<'de>(buf: &mut impl BufReader<'de>) -> Result<Vec<u8>, DecodeError> {
    let len = buf.get_u64()?;
    if len > MAX_BYTES_LEN {
        return Err(DecodeError::BytesTooLong {
            len,
            max: MAX_BYTES_LEN,
        });
    }
    Ok(buf.get_slice(len as usize)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn primitives_roundtrip() {
        let mut buf = Vec::new();
        buf.put_u8(0xab);
        buf.put_u16(0xbeef);
        buf.put_u32(0xdead_beef);
        buf.put_u64(0x0123_4567_89ab_cdef);
        buf.put_i64(-42);
        buf.put_f64(1.5);

        let mut r = buf.as_slice();
        assert_eq!(r.get_u8().unwrap(), 0xab);
        assert_eq!(r.get_u16().unwrap(), 0xbeef);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert_eq!(r.get_f64().unwrap(), 1.5);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_read_reports_length() {
        let mut r: &[u8] = &[1, 2];
        assert_eq!(
            r.get_u32(),
            Err(DecodeError::BufferLength { needed: 4, have: 2 })
        );
    }

    #[test]
    fn str_roundtrip_and_limit() {
        let mut buf = Vec::new();
        put_str(&mut buf, "héllo");
        let mut r = buf.as_slice();
        assert_eq!(get_str(&mut r).unwrap(), "héllo");

        // A length prefix beyond the limit is rejected before any allocation.
        let mut huge = Vec::new();
        huge.put_u64(MAX_STRING_LEN + 1);
        let mut r = huge.as_slice();
        assert!(matches!(
            get_str(&mut r),
            Err(DecodeError::StringTooLong { .. })
        ));
    }

    #[test]
    fn count_writer_matches_vec() {
        let mut counter = CountWriter::new();
        counter.put_u32(7);
        put_str(&mut counter, "abc");

        let mut buf = Vec::new();
        buf.put_u32(7);
        put_str(&mut buf, "abc");

        assert_eq!(counter.len(), buf.len());
    }
}
