//! In-memory write buffer keyed by encoded internal keys.

use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::base::{InternalKey, InternalKeyKind, OrderedKey, TRAILER_LEN};
use crate::error::{Error, Result};

/// An ordered in-memory table. Writers append entries with committed
/// sequence numbers; readers filter by a visibility ceiling, so one memtable
/// serves every open snapshot at once.
#[derive(Default)]
pub struct Memtable {
    entries: Mutex<BTreeMap<OrderedKey, Vec<u8>>>,
    approximate_size: AtomicUsize,
}

impl Memtable {
    /// An empty memtable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one entry with its committed sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the table lock is poisoned.
    pub fn insert(
        &self,
        key: &[u8],
        seq_num: u64,
        kind: InternalKeyKind,
        value: &[u8],
    ) -> Result<()> {
        let encoded = InternalKey::new(key, seq_num, kind).encode();
        self.approximate_size
            .fetch_add(encoded.len() + value.len(), Ordering::Relaxed);
        self.lock_entries()?.insert(OrderedKey(encoded), value.to_vec());
        Ok(())
    }

    /// Rough footprint in bytes, used for flush decisions.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().map(|e| e.is_empty()).unwrap_or(true)
    }

    /// Materialize the entries within an encoded-internal-key range, in
    /// order. `None` bounds are unbounded. Used by iterators, which capture
    /// a consistent snapshot at creation time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the table lock is poisoned.
    pub fn collect_range(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.lock_entries()?;
        let lower_bound = lower.map_or(Bound::Unbounded, |k| Bound::Included(OrderedKey(k.to_vec())));
        let upper_bound = upper.map_or(Bound::Unbounded, |k| Bound::Excluded(OrderedKey(k.to_vec())));
        Ok(entries
            .range((lower_bound, upper_bound))
            .map(|(key, value)| (key.0.clone(), value.clone()))
            .collect())
    }

    /// Materialize every entry in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the table lock is poisoned.
    pub fn collect_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.collect_range(None, None)
    }

    fn lock_entries(&self) -> Result<MutexGuard<'_, BTreeMap<OrderedKey, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned memtable lock")))
    }
}

/// The exclusive upper bound that captures every version of `user_key`:
/// the search key of the shortest strictly greater user key.
#[must_use]
pub fn versions_upper_bound(user_key: &[u8]) -> Vec<u8> {
    let mut successor = Vec::with_capacity(user_key.len() + 1 + TRAILER_LEN);
    successor.extend_from_slice(user_key);
    successor.push(0);
    InternalKey::search_key(successor).encode()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
