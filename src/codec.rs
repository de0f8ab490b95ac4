//! Keys and values are persisted as UTF-16LE blobs. `LENGTH()` on a blob is
//! then exactly the byte contribution counted against the origin's quota, and
//! `ORDER BY key` sorts by those raw bytes.

use crate::error::StorageError;

/// Length in UTF-16 code units, the unit every string limit is expressed in.
pub fn len16(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Quota contribution of one stored string.
pub fn byte_cost(s: &str) -> i64 {
    2 * len16(s) as i64
}

pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<String, StorageError> {
    if bytes.len() % 2 != 0 {
        return Err(StorageError::Encoding(format!(
            "blob of odd length {} is not utf-16",
            bytes.len()
        )));
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| StorageError::Encoding(e.to_string()))
}
