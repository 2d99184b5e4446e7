//! Write batches and their wire format.
//!
//! A batch is the unit of atomic application. Wire format:
//!
//! ```text
//! LE64(base sequence number) ‖ LE32(entry count)
//! entry = kind ‖ uvarint(len(key)) ‖ key [‖ uvarint(len(value)) ‖ value]
//! ```
//!
//! Tombstones carry no value field; `DELSIZED` carries the expected shadowed
//! size as a varint value; `LOGDATA` entries are written to the WAL but never
//! indexed or applied.
//!
//! Indexed batches additionally maintain an ordered index keyed by internal
//! keys whose sequence numbers carry [`SEQ_NUM_BATCH_BIT`], so reads and
//! iterators inside an open transaction observe the batch's own writes
//! without publishing them.

use std::collections::BTreeMap;

use crate::base::{InternalKey, InternalKeyKind, OrderedKey, SEQ_NUM_BATCH_BIT};
use crate::error::{Error, Result};
use crate::varint::{put_uvarint, uvarint};

/// Width of the batch header: base sequence number + entry count.
pub const HEADER_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// An atomic group of writes.
pub struct Batch {
    /// Wire representation; the first 12 bytes are the header.
    data: Vec<u8>,
    count: u32,
    /// Present on indexed batches: encoded internal key (batch-local
    /// sequence number) → value bytes.
    index: Option<BTreeMap<OrderedKey, Vec<u8>>>,
}

impl Batch {
    /// A plain batch, for the write path only.
    #[must_use]
    pub fn new() -> Self {
        Self::with_index(false)
    }

    /// An indexed batch, readable before commit.
    #[must_use]
    pub fn new_indexed() -> Self {
        Self::with_index(true)
    }

    fn with_index(indexed: bool) -> Self {
        Self {
            data: vec![0u8; HEADER_LEN],
            count: 0,
            index: indexed.then(BTreeMap::new),
        }
    }

    /// Number of entries.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Whether the batch holds no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Record a `SET`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.add_entry(InternalKeyKind::Set, key, Some(value));
    }

    /// Record a point deletion.
    pub fn delete(&mut self, key: &[u8]) {
        self.add_entry(InternalKeyKind::Delete, key, None);
    }

    /// Record a single-shot deletion.
    pub fn single_delete(&mut self, key: &[u8]) {
        self.add_entry(InternalKeyKind::SingleDelete, key, None);
    }

    /// Record a deletion carrying the expected size of the shadowed entry.
    pub fn delete_sized(&mut self, key: &[u8], size: u32) {
        let mut value = Vec::new();
        put_uvarint(&mut value, u64::from(size));
        self.add_entry(InternalKeyKind::DeleteSized, key, Some(&value));
    }

    /// Record a merge operand.
    pub fn merge(&mut self, key: &[u8], value: &[u8]) {
        self.add_entry(InternalKeyKind::Merge, key, Some(value));
    }

    /// Record an opaque WAL-only payload.
    pub fn log_data(&mut self, data: &[u8]) {
        self.add_entry(InternalKeyKind::LogData, data, None);
    }

    fn add_entry(&mut self, kind: InternalKeyKind, key: &[u8], value: Option<&[u8]>) {
        self.data.push(kind as u8);
        put_uvarint(&mut self.data, key.len() as u64);
        self.data.extend_from_slice(key);
        if let Some(value) = value {
            put_uvarint(&mut self.data, value.len() as u64);
            self.data.extend_from_slice(value);
        }

        let ordinal = u64::from(self.count);
        self.count += 1;

        if kind == InternalKeyKind::LogData {
            return;
        }
        if let Some(index) = self.index.as_mut() {
            let ikey = InternalKey::new(key, SEQ_NUM_BATCH_BIT | ordinal, kind);
            index.insert(OrderedKey(ikey.encode()), value.unwrap_or_default().to_vec());
        }
    }

    /// Finalize the header with `base_seq` and return the wire bytes.
    pub fn encode(&mut self, base_seq: u64) -> &[u8] {
        self.data[..8].copy_from_slice(&base_seq.to_le_bytes());
        self.data[8..HEADER_LEN].copy_from_slice(&self.count.to_le_bytes());
        &self.data
    }

    /// Snapshot the indexed entries in internal-key order.
    ///
    /// Returns encoded internal keys (batch-local sequence numbers) with
    /// their values. Empty for unindexed batches.
    #[must_use]
    pub fn indexed_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.index
            .as_ref()
            .map(|index| {
                index
                    .iter()
                    .map(|(key, value)| (key.0.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterate the raw entries in insertion order.
    #[must_use]
    pub fn reader(&self) -> BatchReader<'_> {
        BatchReader {
            rest: &self.data[HEADER_LEN..],
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One decoded batch entry.
#[derive(Debug, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    /// Entry kind.
    pub kind: InternalKeyKind,
    /// User key (or opaque payload for `LOGDATA`).
    pub key: &'a [u8],
    /// Value bytes; empty for valueless kinds.
    pub value: &'a [u8],
}

/// Cursor over a batch's wire entries.
pub struct BatchReader<'a> {
    rest: &'a [u8],
}

impl<'a> BatchReader<'a> {
    /// Decode the next entry, or `None` when exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed entries.
    pub fn next(&mut self) -> Result<Option<BatchEntry<'a>>> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let kind = InternalKeyKind::from_u8(self.rest[0]);
        if kind == InternalKeyKind::Invalid {
            return Err(Error::corruption(format!(
                "invalid batch entry kind: {}",
                self.rest[0]
            )));
        }
        self.rest = &self.rest[1..];

        let key = self.take_slice()?;
        let value = if has_value(kind) { self.take_slice()? } else { &[] };
        Ok(Some(BatchEntry { kind, key, value }))
    }

    fn take_slice(&mut self) -> Result<&'a [u8]> {
        let (len, used) = uvarint(self.rest)?;
        let len = usize::try_from(len).map_err(|_| Error::corruption("batch entry too large"))?;
        let end = used
            .checked_add(len)
            .filter(|&end| end <= self.rest.len())
            .ok_or_else(|| Error::corruption("truncated batch entry"))?;
        let slice = &self.rest[used..end];
        self.rest = &self.rest[end..];
        Ok(slice)
    }
}

const fn has_value(kind: InternalKeyKind) -> bool {
    matches!(
        kind,
        InternalKeyKind::Set | InternalKeyKind::Merge | InternalKeyKind::DeleteSized
    )
}

/// Decode the header of an encoded batch: `(base sequence number, count)`.
///
/// # Errors
///
/// Returns [`Error::Corruption`] if the buffer is shorter than a header.
pub fn decode_header(data: &[u8]) -> Result<(u64, u32)> {
    if data.len() < HEADER_LEN {
        return Err(Error::corruption("batch shorter than its header"));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&data[..8]);
    let mut count = [0u8; 4];
    count.copy_from_slice(&data[8..HEADER_LEN]);
    Ok((u64::from_le_bytes(seq), u32::from_le_bytes(count)))
}

/// Cursor over an encoded batch (header + entries), for WAL replay.
///
/// # Errors
///
/// Returns [`Error::Corruption`] if the buffer is shorter than a header.
pub fn decode_entries(data: &[u8]) -> Result<BatchReader<'_>> {
    if data.len() < HEADER_LEN {
        return Err(Error::corruption("batch shorter than its header"));
    }
    Ok(BatchReader {
        rest: &data[HEADER_LEN..],
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{trailer_kind, trailer_seq_num, split_encoded};

    #[test]
    fn wire_roundtrip_preserves_entries() {
        let mut batch = Batch::new();
        batch.set(b"roses", b"red");
        batch.delete(b"violets");
        batch.merge(b"m", b"operand");
        batch.single_delete(b"s");
        batch.delete_sized(b"big", 508);
        batch.log_data(b"audit");
        batch.set(b"", b"");

        let encoded = batch.encode(42).to_vec();
        let (seq, count) = decode_header(&encoded).expect("header");
        assert_eq!(seq, 42);
        assert_eq!(count, 7);

        let mut reader = decode_entries(&encoded).expect("entries");
        let expected: &[(InternalKeyKind, &[u8], &[u8])] = &[
            (InternalKeyKind::Set, b"roses", b"red"),
            (InternalKeyKind::Delete, b"violets", b""),
            (InternalKeyKind::Merge, b"m", b"operand"),
            (InternalKeyKind::SingleDelete, b"s", b""),
            (InternalKeyKind::DeleteSized, b"big", &[0xfc, 0x03]),
            (InternalKeyKind::LogData, b"audit", b""),
            (InternalKeyKind::Set, b"", b""),
        ];
        for &(kind, key, value) in expected {
            let entry = reader.next().expect("decode").expect("entry present");
            assert_eq!(entry.kind, kind);
            assert_eq!(entry.key, key);
            assert_eq!(entry.value, value);
        }
        assert!(reader.next().expect("decode").is_none());
    }

    #[test]
    fn indexed_batch_orders_by_internal_key() {
        let mut batch = Batch::new_indexed();
        batch.set(b"b", b"1");
        batch.set(b"a", b"2");
        batch.set(b"a", b"3");

        let entries = batch.indexed_entries();
        assert_eq!(entries.len(), 3);
        // "a" before "b"; within "a", the later write (higher ordinal) first.
        let (first_user, first_trailer) = split_encoded(&entries[0].0).expect("ikey");
        assert_eq!(first_user, b"a");
        assert_eq!(trailer_seq_num(first_trailer), SEQ_NUM_BATCH_BIT | 2);
        assert_eq!(entries[0].1, b"3");
        let (second_user, _) = split_encoded(&entries[1].0).expect("ikey");
        assert_eq!(second_user, b"a");
        let (third_user, _) = split_encoded(&entries[2].0).expect("ikey");
        assert_eq!(third_user, b"b");
    }

    #[test]
    fn log_data_is_not_indexed() {
        let mut batch = Batch::new_indexed();
        batch.log_data(b"not a key");
        batch.set(b"k", b"v");
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.indexed_entries().len(), 1);
    }

    #[test]
    fn tombstones_are_indexed_with_their_kind() {
        let mut batch = Batch::new_indexed();
        batch.delete(b"k");
        let entries = batch.indexed_entries();
        let (_, trailer) = split_encoded(&entries[0].0).expect("ikey");
        assert_eq!(trailer_kind(trailer), InternalKeyKind::Delete);
    }

    #[test]
    fn unindexed_batch_has_no_indexed_entries() {
        let mut batch = Batch::new();
        batch.set(b"k", b"v");
        assert!(batch.indexed_entries().is_empty());
    }

    #[test]
    fn decode_rejects_malformed_kind() {
        let mut data = vec![0u8; HEADER_LEN];
        data.push(200); // not a valid kind
        let mut reader = decode_entries(&data).expect("entries");
        assert!(reader.next().is_err());
    }

    #[test]
    fn decode_rejects_truncated_value() {
        let mut batch = Batch::new();
        batch.set(b"key", b"value");
        let mut encoded = batch.encode(1).to_vec();
        encoded.truncate(encoded.len() - 2);
        let mut reader = decode_entries(&encoded).expect("entries");
        assert!(reader.next().is_err());
    }
}
