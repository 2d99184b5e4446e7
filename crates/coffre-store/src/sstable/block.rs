//! Prefix-compressed table blocks.
//!
//! Entry layout: `uvarint(shared) ‖ uvarint(unshared) ‖ uvarint(value len) ‖
//! key delta ‖ value`. Every `restart_interval`-th entry stores its full key;
//! the restart offsets (LE u32 each) and their count trail the block. Keys
//! are encoded internal keys and all ordering uses the internal comparator.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::base::cmp_encoded;
use crate::error::{Error, Result};
use crate::varint::{put_uvarint, uvarint};

/// Restart interval for data blocks.
pub const DATA_RESTART_INTERVAL: usize = 16;

/// Restart interval for index-style blocks (every entry is a restart).
pub const INDEX_RESTART_INTERVAL: usize = 1;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates sorted entries into a block.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
    entries: usize,
}

impl BlockBuilder {
    /// A builder with the given restart interval.
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            counter: 0,
            last_key: Vec::new(),
            entries: 0,
        }
    }

    /// Append an entry. Keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter % self.restart_interval == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };

        put_uvarint(&mut self.buf, shared as u64);
        put_uvarint(&mut self.buf, (key.len() - shared) as u64);
        put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
        self.entries += 1;
    }

    /// Number of entries added.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Whether nothing has been added.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Current size once finished, in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// The last key added.
    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Finish the block and reset the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut block = std::mem::take(&mut self.buf);
        // An empty block still carries one restart so readers need no
        // special case.
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        for &restart in &self.restarts {
            block.extend_from_slice(&restart.to_le_bytes());
        }
        block.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        self.restarts.clear();
        self.counter = 0;
        self.last_key.clear();
        self.entries = 0;
        block
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A decoded (plaintext, decompressed) block.
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    /// Wrap raw block bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if the restart trailer is malformed.
    pub fn new(data: Vec<u8>) -> Result<Arc<Self>> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short for restart count"));
        }
        let mut count = [0u8; 4];
        count.copy_from_slice(&data[data.len() - 4..]);
        let num_restarts = u32::from_le_bytes(count) as usize;
        let restarts_len = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::corruption("block restart count overflows"))?;
        if num_restarts == 0 || restarts_len > data.len() {
            return Err(Error::corruption("block restart array is malformed"));
        }
        let restarts_offset = data.len() - restarts_len;
        Ok(Arc::new(Self {
            data,
            restarts_offset,
            num_restarts,
        }))
    }

    fn restart_point(&self, i: usize) -> usize {
        let at = self.restarts_offset + i * 4;
        let mut offset = [0u8; 4];
        offset.copy_from_slice(&self.data[at..at + 4]);
        u32::from_le_bytes(offset) as usize
    }
}

// ---------------------------------------------------------------------------
// BlockIter
// ---------------------------------------------------------------------------

/// Cursor over a block's entries.
pub struct BlockIter {
    block: Arc<Block>,
    /// Offset of the current entry; `restarts_offset` when exhausted.
    entry_offset: usize,
    /// Offset just past the current entry.
    next_offset: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    valid: bool,
}

impl BlockIter {
    /// An unpositioned iterator over `block`.
    #[must_use]
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            entry_offset: 0,
            next_offset: 0,
            key: Vec::new(),
            value_range: (0, 0),
            valid: false,
        }
    }

    /// Whether the cursor is positioned on an entry.
    #[must_use]
    pub const fn valid(&self) -> bool {
        self.valid
    }

    /// Current encoded internal key. Empty when invalid.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        if self.valid {
            &self.key
        } else {
            &[]
        }
    }

    /// Current value. Empty when invalid.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        if self.valid {
            &self.block.data[self.value_range.0..self.value_range.1]
        } else {
            &[]
        }
    }

    /// Position on the first entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn first(&mut self) -> Result<()> {
        self.jump_to_restart(0);
        self.parse_next()
    }

    /// Position on the last entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn last(&mut self) -> Result<()> {
        self.jump_to_restart(self.block.num_restarts - 1);
        self.parse_next()?;
        while self.valid && self.next_offset < self.block.restarts_offset {
            self.parse_next()?;
        }
        Ok(())
    }

    /// Position on the first entry with key ≥ `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        // Find the last restart whose key is < target, then scan forward.
        let mut lo = 0usize;
        let mut hi = self.block.num_restarts;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let key = self.restart_key(mid)?;
            if cmp_encoded(&key, target) == Ordering::Less {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        self.jump_to_restart(lo);
        self.parse_next()?;
        while self.valid && cmp_encoded(&self.key, target) == Ordering::Less {
            self.parse_next()?;
        }
        Ok(())
    }

    /// Position on the last entry with key < `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        self.seek_ge(target)?;
        if self.valid {
            self.prev()
        } else {
            // Every key is < target (or the block is being re-positioned
            // from an exhausted state): the answer is the last entry.
            self.last()
        }
    }

    /// Advance to the next entry; invalid at the end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        self.entry_offset = self.next_offset;
        self.parse_next()
    }

    /// Step back to the previous entry; invalid before the first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a malformed entry.
    pub fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let target = self.entry_offset;
        if target == 0 {
            self.valid = false;
            return Ok(());
        }
        // Replay from the last restart before the current entry.
        let mut restart = self.block.num_restarts - 1;
        while self.block.restart_point(restart) >= target {
            restart -= 1;
        }
        self.jump_to_restart(restart);
        self.parse_next()?;
        while self.next_offset < target {
            self.parse_next()?;
        }
        Ok(())
    }

    fn jump_to_restart(&mut self, i: usize) {
        let offset = self.block.restart_point(i);
        self.entry_offset = offset;
        self.next_offset = offset;
        self.key.clear();
        self.valid = false;
    }

    /// Full key stored at restart `i` (restarts always have `shared == 0`).
    fn restart_key(&self, i: usize) -> Result<Vec<u8>> {
        let offset = self.block.restart_point(i);
        let data = &self.block.data[..self.block.restarts_offset];
        let rest = data
            .get(offset..)
            .ok_or_else(|| Error::corruption("block restart offset out of range"))?;
        let (_, used_shared) = uvarint(rest)?;
        let (unshared, used_unshared) = uvarint(&rest[used_shared..])?;
        let (_, used_value) = uvarint(&rest[used_shared + used_unshared..])?;
        let key_start = used_shared + used_unshared + used_value;
        let key_end = key_start + unshared as usize;
        rest.get(key_start..key_end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::corruption("block restart key out of range"))
    }

    /// Parse the entry at `next_offset`, making it current.
    fn parse_next(&mut self) -> Result<()> {
        self.entry_offset = self.next_offset;
        if self.entry_offset >= self.block.restarts_offset {
            self.valid = false;
            return Ok(());
        }
        let data = &self.block.data[..self.block.restarts_offset];
        let rest = &data[self.entry_offset..];

        let (shared, used_shared) = uvarint(rest)?;
        let (unshared, used_unshared) = uvarint(&rest[used_shared..])?;
        let (value_len, used_value) = uvarint(&rest[used_shared + used_unshared..])?;
        let header = used_shared + used_unshared + used_value;

        let shared = shared as usize;
        let unshared = unshared as usize;
        let value_len = value_len as usize;
        if shared > self.key.len() || header + unshared + value_len > rest.len() {
            return Err(Error::corruption("block entry is malformed"));
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&rest[header..header + unshared]);
        let value_start = self.entry_offset + header + unshared;
        self.value_range = (value_start, value_start + value_len);
        self.next_offset = value_start + value_len;
        self.valid = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{InternalKey, InternalKeyKind};

    fn ikey(user: &str, seq: u64) -> Vec<u8> {
        InternalKey::new(user.as_bytes(), seq, InternalKeyKind::Set).encode()
    }

    fn build_block(entries: &[(Vec<u8>, &[u8])], interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Block::new(builder.finish()).expect("block parses")
    }

    fn sample_entries() -> Vec<(Vec<u8>, &'static [u8])> {
        vec![
            (ikey("apple", 12), b"a".as_slice()),
            (ikey("apple", 10), b"b".as_slice()),
            (ikey("banana", 11), b"c".as_slice()),
            (ikey("cherry", 15), b"d".as_slice()),
            (ikey("cherry", 14), b"e".as_slice()),
            (ikey("damson", 20), b"f".as_slice()),
        ]
    }

    #[test]
    fn forward_scan_returns_all_entries_in_order() {
        for interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build_block(&entries, interval);
            let mut iter = BlockIter::new(block);
            iter.first().expect("first");
            for (key, value) in &entries {
                assert!(iter.valid(), "interval {interval}");
                assert_eq!(iter.key(), &key[..]);
                assert_eq!(iter.value(), *value);
                iter.next().expect("next");
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn backward_scan_returns_all_entries_in_reverse() {
        for interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build_block(&entries, interval);
            let mut iter = BlockIter::new(block);
            iter.last().expect("last");
            for (key, value) in entries.iter().rev() {
                assert!(iter.valid(), "interval {interval}");
                assert_eq!(iter.key(), &key[..]);
                assert_eq!(iter.value(), *value);
                iter.prev().expect("prev");
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn seek_ge_lands_on_first_matching_entry() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::new(block);

        iter.seek_ge(&InternalKey::search_key(b"banana".as_slice()).encode())
            .expect("seek_ge");
        assert!(iter.valid());
        assert_eq!(iter.key(), &ikey("banana", 11)[..]);

        // Between user keys: lands on the next one.
        iter.seek_ge(&InternalKey::search_key(b"bz".as_slice()).encode())
            .expect("seek_ge");
        assert!(iter.valid());
        assert_eq!(iter.key(), &ikey("cherry", 15)[..]);

        // Past the end.
        iter.seek_ge(&InternalKey::search_key(b"zzz".as_slice()).encode())
            .expect("seek_ge");
        assert!(!iter.valid());
    }

    #[test]
    fn seek_ge_respects_trailer_order_within_user_key() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::new(block);
        // Seeking at seq 11 must skip the seq-12 version of "apple".
        iter.seek_ge(&InternalKey::new(b"apple".as_slice(), 11, InternalKeyKind::Set).encode())
            .expect("seek_ge");
        assert!(iter.valid());
        assert_eq!(iter.key(), &ikey("apple", 10)[..]);
    }

    #[test]
    fn seek_lt_lands_on_last_smaller_entry() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::new(block);

        iter.seek_lt(&InternalKey::search_key(b"cherry".as_slice()).encode())
            .expect("seek_lt");
        assert!(iter.valid());
        assert_eq!(iter.key(), &ikey("banana", 11)[..]);

        // Before the first entry.
        iter.seek_lt(&InternalKey::search_key(b"aaa".as_slice()).encode())
            .expect("seek_lt");
        assert!(!iter.valid());

        // Past the end: the last entry.
        iter.seek_lt(&InternalKey::search_key(b"zzz".as_slice()).encode())
            .expect("seek_lt");
        assert!(iter.valid());
        assert_eq!(iter.key(), &ikey("damson", 20)[..]);
    }

    #[test]
    fn single_entry_block() {
        let entries = vec![(ikey("only", 10), b"v".as_slice())];
        let block = build_block(&entries, 16);
        let mut iter = BlockIter::new(block);
        iter.first().expect("first");
        assert!(iter.valid());
        iter.prev().expect("prev");
        assert!(!iter.valid());
    }

    #[test]
    fn empty_block_is_always_invalid() {
        let mut builder = BlockBuilder::new(16);
        let block = Block::new(builder.finish()).expect("empty block parses");
        let mut iter = BlockIter::new(block);
        iter.first().expect("first");
        assert!(!iter.valid());
        iter.last().expect("last");
        assert!(!iter.valid());
    }

    #[test]
    fn malformed_restart_trailer_is_rejected() {
        assert!(Block::new(vec![1, 2]).is_err());
        // Restart count larger than the block.
        assert!(Block::new(vec![0xff, 0xff, 0xff, 0x7f]).is_err());
    }
}
