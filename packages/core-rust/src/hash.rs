//! Digests used to detect drift between a physical table and its source.
//!
//! * [`schema_hash`] fingerprints an ordered column list.
//! * [`view_row_checksum`] is an order-independent sum over
//!   `id-etag-benefactor` rows, mirroring the `SUM(CRC32(...))` aggregate the
//!   relational backend computes for view tables.

use sha2::{Digest, Sha256};

use crate::types::ColumnModel;

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash of a string.
///
/// # Examples
///
/// ```
/// use tabledex_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for code_unit in s.encode_utf16() {
        hash ^= u32::from(code_unit);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Combines hash values into a single order-independent hash using wrapping
/// addition.
///
/// ```
/// use tabledex_core::hash::combine_hashes;
///
/// assert_eq!(combine_hashes(&[10, 20, 30]), combine_hashes(&[30, 10, 20]));
/// ```
#[must_use]
pub fn combine_hashes(hashes: &[u32]) -> u32 {
    let mut result: u32 = 0;
    for &h in hashes {
        result = result.wrapping_add(h);
    }
    result
}

/// Hex SHA-256 over the ordered column ids, so reordering columns counts as
/// a schema change while renaming a column does not.
#[must_use]
pub fn schema_hash(schema: &[ColumnModel]) -> String {
    schema_hash_for_ids(schema.iter().map(|c| c.id))
}

#[must_use]
pub fn schema_hash_for_ids(ids: impl IntoIterator<Item = i64>) -> String {
    let mut hasher = Sha256::new();
    for (position, id) in ids.into_iter().enumerate() {
        if position > 0 {
            hasher.update(b"+");
        }
        hasher.update(id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Checksum contribution of one view row.
#[must_use]
pub fn view_row_hash(row_id: i64, etag: &str, benefactor_id: i64) -> u32 {
    fnv1a_hash(&format!("{row_id}-{etag}-{benefactor_id}"))
}

/// Sum of [`view_row_hash`] over rows, independent of row order.
#[must_use]
pub fn view_row_checksum<'a>(rows: impl IntoIterator<Item = (i64, &'a str, i64)>) -> i64 {
    let hashes: Vec<u32> = rows
        .into_iter()
        .map(|(id, etag, benefactor)| view_row_hash(id, etag, benefactor))
        .collect();
    i64::from(combine_hashes(&hashes))
}
