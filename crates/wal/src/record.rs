//! Log record codec.
//!
//! On disk every record is
//!
//! ```text
//! kind:u8 | txn_id:i64 | collection_len:u32 | collection
//!         | doc_id_len:u32 | doc_id | payload_len:u32 | payload | crc32:u32
//! ```
//!
//! with the CRC computed over all preceding bytes of the record.

use tissdb_model::buffer::{BufReader, BufWriter, DecodeError};

use crate::error::{ChecksumMismatch, RecordError};

/// Transaction id carried by records outside any transaction.
pub const NO_TXN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Put = 1,
    Delete = 2,
    CreateCollection = 3,
    DeleteCollection = 4,
    TxnCommit = 5,
    TxnAbort = 6,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RecordKind::Put,
            2 => RecordKind::Delete,
            3 => RecordKind::CreateCollection,
            4 => RecordKind::DeleteCollection,
            5 => RecordKind::TxnCommit,
            6 => RecordKind::TxnAbort,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub txn_id: i64,
    pub collection: String,
    pub doc_id: String,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn put(collection: impl Into<String>, doc_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Put,
            txn_id: NO_TXN,
            collection: collection.into(),
            doc_id: doc_id.into(),
            payload,
        }
    }

    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Delete,
            txn_id: NO_TXN,
            collection: collection.into(),
            doc_id: doc_id.into(),
            payload: Vec::new(),
        }
    }

    pub fn create_collection(collection: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::CreateCollection,
            txn_id: NO_TXN,
            collection: collection.into(),
            doc_id: String::new(),
            payload,
        }
    }

    pub fn delete_collection(collection: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::DeleteCollection,
            txn_id: NO_TXN,
            collection: collection.into(),
            doc_id: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn txn_commit(txn_id: i64, payload: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::TxnCommit,
            txn_id,
            collection: String::new(),
            doc_id: String::new(),
            payload,
        }
    }

    pub fn txn_abort(txn_id: i64) -> Self {
        Self {
            kind: RecordKind::TxnAbort,
            txn_id,
            collection: String::new(),
            doc_id: String::new(),
            payload: Vec::new(),
        }
    }

    /// Append the encoded record, including its trailing checksum, to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.put_u8(self.kind as u8);
        out.put_i64(self.txn_id);
        put_lstr(out, &self.collection);
        put_lstr(out, &self.doc_id);
        out.put_u32(self.payload.len() as u32);
        out.put_slice(&self.payload);
        let crc = crc32c::crc32c(&out[start..]);
        out.put_u32(crc);
    }

    /// Decode one record from the front of `buf`, advancing it past the
    /// record on success.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, RecordError> {
        let full: &[u8] = buf;
        let kind_byte = buf.get_u8()?;
        let kind = RecordKind::from_u8(kind_byte).ok_or(RecordError::UnknownKind(kind_byte))?;
        let txn_id = buf.get_i64()?;
        let collection = get_lstr(buf)?;
        let doc_id = get_lstr(buf)?;
        let payload_len = buf.get_u32()? as usize;
        let payload = buf.get_slice(payload_len)?.to_vec();

        let body_len = full.len() - buf.len();
        let expected = buf.get_u32()?;
        let actual = crc32c::crc32c(&full[..body_len]);
        if actual != expected {
            return Err(ChecksumMismatch.into());
        }

        Ok(Self {
            kind,
            txn_id,
            collection,
            doc_id,
            payload,
        })
    }
}

fn put_lstr(out: &mut Vec<u8>, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn get_lstr(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = buf.get_u32()? as usize;
    let bytes = buf.get_slice(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn records_roundtrip() {
        let records = [
            Record::put("users", "u1", b"doc-bytes".to_vec()),
            Record::delete("users", "u1"),
            Record::create_collection("orders", b"schema".to_vec()),
            Record::delete_collection("orders"),
            Record::txn_commit(7, b"ops".to_vec()),
            Record::txn_abort(7),
        ];

        let mut buf = Vec::new();
        for record in &records {
            record.encode(&mut buf);
        }

        let mut cursor = buf.as_slice();
        for record in &records {
            assert_eq!(&Record::decode(&mut cursor).unwrap(), record);
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut buf = Vec::new();
        Record::put("users", "u1", b"payload".to_vec()).encode(&mut buf);
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;

        let mut cursor = buf.as_slice();
        assert!(matches!(
            Record::decode(&mut cursor),
            Err(RecordError::Checksum(_)) | Err(RecordError::Decode(_)) | Err(RecordError::UnknownKind(_))
        ));
    }

    #[test]
    fn truncated_record_is_a_decode_error() {
        let mut buf = Vec::new();
        Record::put("users", "u1", b"payload".to_vec()).encode(&mut buf);
        let mut cursor = &buf[..buf.len() - 2];
        assert!(matches!(
            Record::decode(&mut cursor),
            Err(RecordError::Decode(DecodeError::BufferLength { .. }))
        ));
    }
}
