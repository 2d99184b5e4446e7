//! Internal merging iterators and the user-facing cursor.
//!
//! The internal layer merges sorted sources (batch index, memtable, tables)
//! in internal-key order. [`DbIterator`] sits on top and presents the user
//! view: one entry per user key (the newest visible version wins), tombstone
//! and merge collapse, snapshot visibility, reserved-key filtering, bounds,
//! and cooperative cancellation.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::base::{
    cmp_encoded, split_encoded, trailer_kind, trailer_seq_num, InternalKey, InternalKeyKind,
    SEQ_NUM_BATCH_BIT,
};
use crate::counter::MONOTONIC_COUNTER_KEY;
use crate::error::{Error, Result};
use crate::memtable::versions_upper_bound;
use crate::sstable::reader::TableIter;

// ---------------------------------------------------------------------------
// InternalIter
// ---------------------------------------------------------------------------

/// A restartable cursor over encoded internal keys.
pub(crate) trait InternalIter {
    fn seek_ge(&mut self, target: &[u8]) -> Result<()>;
    fn seek_lt(&mut self, target: &[u8]) -> Result<()>;
    fn first(&mut self) -> Result<()>;
    fn last(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn prev(&mut self) -> Result<()>;
    fn valid(&self) -> bool;
    /// Current encoded internal key; empty when invalid.
    fn key(&self) -> &[u8];
    /// Current value; empty when invalid.
    fn value(&self) -> &[u8];
}

impl InternalIter for TableIter {
    fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        Self::seek_ge(self, target)
    }

    fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        Self::seek_lt(self, target)
    }

    fn first(&mut self) -> Result<()> {
        Self::first(self)
    }

    fn last(&mut self) -> Result<()> {
        Self::last(self)
    }

    fn next(&mut self) -> Result<()> {
        Self::next(self)
    }

    fn prev(&mut self) -> Result<()> {
        Self::prev(self)
    }

    fn valid(&self) -> bool {
        Self::valid(self)
    }

    fn key(&self) -> &[u8] {
        Self::key(self)
    }

    fn value(&self) -> &[u8] {
        Self::value(self)
    }
}

// ---------------------------------------------------------------------------
// VecIter
// ---------------------------------------------------------------------------

/// Cursor over materialized `(internal key, value)` pairs, already sorted.
/// Used for the memtable and batch snapshots an iterator captures at
/// creation.
pub(crate) struct VecIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl VecIter {
    pub(crate) fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { entries, pos: None }
    }

    fn lower_idx(&self, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(key, _)| cmp_encoded(key, target) == Ordering::Less)
    }
}

impl InternalIter for VecIter {
    fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        let idx = self.lower_idx(target);
        self.pos = (idx < self.entries.len()).then_some(idx);
        Ok(())
    }

    fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        self.pos = self.lower_idx(target).checked_sub(1);
        Ok(())
    }

    fn first(&mut self) -> Result<()> {
        self.pos = (!self.entries.is_empty()).then_some(0);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        self.pos = self.entries.len().checked_sub(1);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pos = self
            .pos
            .and_then(|p| (p + 1 < self.entries.len()).then_some(p + 1));
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
        Ok(())
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> &[u8] {
        self.pos.map_or(&[], |p| &self.entries[p].0)
    }

    fn value(&self) -> &[u8] {
        self.pos.map_or(&[], |p| &self.entries[p].1)
    }
}

// ---------------------------------------------------------------------------
// MergingIter
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Merges child cursors in internal-key order. Children are ordered by
/// recency (batch, memtable, then tables newest first); ties on identical
/// keys prefer the earlier child.
pub(crate) struct MergingIter {
    children: Vec<Box<dyn InternalIter>>,
    current: Option<usize>,
    dir: Direction,
}

impl MergingIter {
    pub(crate) fn new(children: Vec<Box<dyn InternalIter>>) -> Self {
        Self {
            children,
            current: None,
            dir: Direction::Forward,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.current.map_or(&[], |i| self.children[i].key())
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.current.map_or(&[], |i| self.children[i].value())
    }

    fn find_min(&mut self) {
        let mut best: Option<usize> = None;
        for i in 0..self.children.len() {
            if !self.children[i].valid() {
                continue;
            }
            best = match best {
                Some(b)
                    if cmp_encoded(self.children[i].key(), self.children[b].key())
                        != Ordering::Less =>
                {
                    Some(b)
                }
                _ => Some(i),
            };
        }
        self.current = best;
    }

    fn find_max(&mut self) {
        let mut best: Option<usize> = None;
        for i in 0..self.children.len() {
            if !self.children[i].valid() {
                continue;
            }
            best = match best {
                Some(b)
                    if cmp_encoded(self.children[i].key(), self.children[b].key())
                        != Ordering::Greater =>
                {
                    Some(b)
                }
                _ => Some(i),
            };
        }
        self.current = best;
    }

    pub(crate) fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek_ge(target)?;
        }
        self.dir = Direction::Forward;
        self.find_min();
        Ok(())
    }

    pub(crate) fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek_lt(target)?;
        }
        self.dir = Direction::Backward;
        self.find_max();
        Ok(())
    }

    pub(crate) fn first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.first()?;
        }
        self.dir = Direction::Forward;
        self.find_min();
        Ok(())
    }

    pub(crate) fn last(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.last()?;
        }
        self.dir = Direction::Backward;
        self.find_max();
        Ok(())
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        assert!(self.dir == Direction::Forward, "next() in backward mode");
        if let Some(i) = self.current {
            self.children[i].next()?;
        }
        self.find_min();
        Ok(())
    }

    pub(crate) fn prev(&mut self) -> Result<()> {
        assert!(self.dir == Direction::Backward, "prev() in forward mode");
        if let Some(i) = self.current {
            self.children[i].prev()?;
        }
        self.find_max();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DbIterator
// ---------------------------------------------------------------------------

/// Newest-visible-version accumulator for backward iteration. Versions of a
/// user key arrive oldest-first when walking backward; each application
/// shadows or extends the state below it.
enum Acc {
    Start,
    Tombstone,
    Value(Vec<u8>),
}

fn apply_version(acc: Acc, kind: InternalKeyKind, operand: &[u8]) -> Acc {
    match kind {
        InternalKeyKind::Set | InternalKeyKind::SetWithDelete => Acc::Value(operand.to_vec()),
        k if k.is_tombstone() => Acc::Tombstone,
        InternalKeyKind::Merge => match acc {
            Acc::Value(mut value) => {
                value.extend_from_slice(operand);
                Acc::Value(value)
            }
            Acc::Tombstone | Acc::Start => Acc::Value(operand.to_vec()),
        },
        _ => acc,
    }
}

/// A user-facing cursor. Unpositioned at creation; position it with
/// [`DbIterator::first`], [`DbIterator::last`], [`DbIterator::seek_ge`], or
/// [`DbIterator::seek_lt`].
pub struct DbIterator {
    merge: MergingIter,
    visible_seq: u64,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    cancel: Option<Arc<AtomicBool>>,
    include_reserved: bool,
    dir: Direction,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    err: Option<Error>,
}

impl DbIterator {
    pub(crate) fn new(
        children: Vec<Box<dyn InternalIter>>,
        visible_seq: u64,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        cancel: Option<Arc<AtomicBool>>,
        include_reserved: bool,
    ) -> Self {
        Self {
            merge: MergingIter::new(children),
            visible_seq,
            lower,
            upper,
            cancel,
            include_reserved,
            dir: Direction::Forward,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            err: None,
        }
    }

    /// Whether the cursor is positioned on an entry.
    #[must_use]
    pub const fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Only meaningful while [`DbIterator::valid`].
    #[must_use]
    pub fn key(&self) -> &[u8] {
        if self.valid {
            &self.key
        } else {
            &[]
        }
    }

    /// Current value. Only meaningful while [`DbIterator::valid`].
    #[must_use]
    pub fn value(&self) -> &[u8] {
        if self.valid {
            &self.value
        } else {
            &[]
        }
    }

    /// The error that invalidated the iterator, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Close the iterator, surfacing any deferred error.
    ///
    /// # Errors
    ///
    /// Returns the error that invalidated the iterator, if any.
    pub fn close(self) -> Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Position on the first entry. Returns [`DbIterator::valid`].
    pub fn first(&mut self) -> bool {
        self.err = None;
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            match self.lower.clone() {
                Some(lower) => self.merge.seek_ge(&InternalKey::search_key(lower).encode())?,
                None => self.merge.first()?,
            }
            self.dir = Direction::Forward;
            self.find_next_user_entry()
        })();
        self.settle(result)
    }

    /// Position on the last entry. Returns [`DbIterator::valid`].
    pub fn last(&mut self) -> bool {
        self.err = None;
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            match self.upper.clone() {
                Some(upper) => self.merge.seek_lt(&InternalKey::search_key(upper).encode())?,
                None => self.merge.last()?,
            }
            self.dir = Direction::Backward;
            self.find_prev_user_entry()
        })();
        self.settle(result)
    }

    /// Position on the first entry with user key ≥ `key`. Returns
    /// [`DbIterator::valid`].
    pub fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.err = None;
        let target = match &self.lower {
            Some(lower) if key < &lower[..] => lower.clone(),
            _ => key.to_vec(),
        };
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            self.merge
                .seek_ge(&InternalKey::search_key(target).encode())?;
            self.dir = Direction::Forward;
            self.find_next_user_entry()
        })();
        self.settle(result)
    }

    /// Position on the last entry with user key < `key`. Returns
    /// [`DbIterator::valid`].
    pub fn seek_lt(&mut self, key: &[u8]) -> bool {
        self.err = None;
        let target = match &self.upper {
            Some(upper) if key > &upper[..] => upper.clone(),
            _ => key.to_vec(),
        };
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            self.merge
                .seek_lt(&InternalKey::search_key(target).encode())?;
            self.dir = Direction::Backward;
            self.find_prev_user_entry()
        })();
        self.settle(result)
    }

    /// Advance to the next entry. Returns [`DbIterator::valid`].
    pub fn next(&mut self) -> bool {
        if self.err.is_some() || !self.valid {
            return false;
        }
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            match self.dir {
                Direction::Forward => {
                    let current = self.key.clone();
                    self.skip_user_key_forward(&current)?;
                }
                Direction::Backward => {
                    let bound = versions_upper_bound(&self.key);
                    self.merge.seek_ge(&bound)?;
                    self.dir = Direction::Forward;
                }
            }
            self.find_next_user_entry()
        })();
        self.settle(result)
    }

    /// Step back to the previous entry. Returns [`DbIterator::valid`].
    pub fn prev(&mut self) -> bool {
        if self.err.is_some() || !self.valid {
            return false;
        }
        let result = (|| -> Result<()> {
            self.check_cancel()?;
            if self.dir == Direction::Forward {
                let current = self.key.clone();
                self.merge
                    .seek_lt(&InternalKey::search_key(current).encode())?;
                self.dir = Direction::Backward;
            }
            self.find_prev_user_entry()
        })();
        self.settle(result)
    }

    // -- internals ---------------------------------------------------------

    fn settle(&mut self, result: Result<()>) -> bool {
        if let Err(err) = result {
            self.err = Some(err);
            self.valid = false;
        }
        self.valid
    }

    fn check_cancel(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.load(AtomicOrdering::Relaxed) {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    fn visible(&self, seq: u64) -> bool {
        seq & SEQ_NUM_BATCH_BIT != 0 || seq <= self.visible_seq
    }

    fn out_of_upper_bound(&self, user: &[u8]) -> bool {
        self.upper.as_deref().is_some_and(|upper| user >= upper)
    }

    fn out_of_lower_bound(&self, user: &[u8]) -> bool {
        self.lower.as_deref().is_some_and(|lower| user < lower)
    }

    fn skip_user_key_forward(&mut self, user: &[u8]) -> Result<()> {
        while self.merge.valid() {
            let Some((current, _)) = split_encoded(self.merge.key()) else {
                break;
            };
            if current != user {
                break;
            }
            self.merge.next()?;
        }
        Ok(())
    }

    /// Walk forward to the next user key with a visible, live value.
    fn find_next_user_entry(&mut self) -> Result<()> {
        self.valid = false;
        while self.merge.valid() {
            self.check_cancel()?;
            let Some((user, trailer)) = split_encoded(self.merge.key()) else {
                return Err(Error::corruption("malformed internal key"));
            };
            let user = user.to_vec();

            if self.out_of_upper_bound(&user) {
                return Ok(());
            }
            if !self.include_reserved && user == MONOTONIC_COUNTER_KEY {
                self.skip_user_key_forward(&user)?;
                continue;
            }
            if !self.visible(trailer_seq_num(trailer)) {
                self.merge.next()?;
                continue;
            }

            match trailer_kind(trailer) {
                InternalKeyKind::Set | InternalKeyKind::SetWithDelete => {
                    self.value = self.merge.value().to_vec();
                    self.key = user;
                    self.valid = true;
                    return Ok(());
                }
                InternalKeyKind::Merge => {
                    self.value = self.resolve_merge_forward(&user)?;
                    self.key = user;
                    self.valid = true;
                    return Ok(());
                }
                kind if kind.is_tombstone() => {
                    self.skip_user_key_forward(&user)?;
                }
                _ => {
                    self.merge.next()?;
                }
            }
        }
        Ok(())
    }

    /// The current entry is a visible merge operand for `user`: collect the
    /// operands below it and fold oldest-first.
    fn resolve_merge_forward(&mut self, user: &[u8]) -> Result<Vec<u8>> {
        // Newest operand first.
        let mut operands = vec![self.merge.value().to_vec()];
        self.merge.next()?;
        while self.merge.valid() {
            self.check_cancel()?;
            let Some((current, trailer)) = split_encoded(self.merge.key()) else {
                return Err(Error::corruption("malformed internal key"));
            };
            if current != user {
                break;
            }
            if !self.visible(trailer_seq_num(trailer)) {
                self.merge.next()?;
                continue;
            }
            match trailer_kind(trailer) {
                InternalKeyKind::Merge => {
                    operands.push(self.merge.value().to_vec());
                    self.merge.next()?;
                }
                InternalKeyKind::Set | InternalKeyKind::SetWithDelete => {
                    operands.push(self.merge.value().to_vec());
                    break;
                }
                // A tombstone terminates the fold.
                _ => break,
            }
        }

        let total = operands.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for operand in operands.iter().rev() {
            out.extend_from_slice(operand);
        }
        Ok(out)
    }

    /// Walk backward to the previous user key with a visible, live value.
    /// Backward traversal visits each user key's versions oldest-first, so
    /// the newest visible version is known once the user key changes.
    fn find_prev_user_entry(&mut self) -> Result<()> {
        self.valid = false;
        let mut group: Option<Vec<u8>> = None;
        let mut acc = Acc::Start;

        while self.merge.valid() {
            self.check_cancel()?;
            let Some((user, trailer)) = split_encoded(self.merge.key()) else {
                return Err(Error::corruption("malformed internal key"));
            };
            let user = user.to_vec();

            if self.out_of_lower_bound(&user) {
                break;
            }

            // On a user-key change, the completed group is resolved: yield
            // it if it carries a value, otherwise fall through and start a
            // new group on the current entry.
            if group.as_deref().is_some_and(|g| g != user.as_slice()) {
                if let Acc::Value(value) = std::mem::replace(&mut acc, Acc::Start) {
                    self.key = group.take().unwrap_or_default();
                    self.value = value;
                    self.valid = true;
                    return Ok(());
                }
                group = None;
            }

            if !self.include_reserved && user == MONOTONIC_COUNTER_KEY {
                self.merge.prev()?;
                continue;
            }
            if self.visible(trailer_seq_num(trailer)) {
                acc = apply_version(acc, trailer_kind(trailer), self.merge.value());
                group = Some(user);
            }
            self.merge.prev()?;
        }

        if let (Some(g), Acc::Value(value)) = (group, acc) {
            self.key = g;
            self.value = value;
            self.valid = true;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
