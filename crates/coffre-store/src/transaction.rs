//! Transaction façade: snapshot reads and batched writes under one handle.
//!
//! Read transactions run concurrently without limit. A writable transaction
//! holds the store's writer mutex for its whole lifetime, so a second
//! writable transaction blocks in [`crate::Db::new_transaction`] until the
//! first commits or closes. Reads inside a writable transaction observe the
//! pre-transaction snapshot merged with the transaction's own writes.
//!
//! Commit drives the monotonic-counter protocol before the batch's atomic
//! application, so every committed state is tied to a counter value the
//! trusted source has seen (or is about to see).

use std::io;
use std::sync::MutexGuard;

use crate::batch::Batch;
use crate::db::{Db, Readable, Value};
use crate::error::{Error, Result};
use crate::iterator::DbIterator;
use crate::options::{IterOptions, SYNC};

/// An open transaction. Must be finished with [`Transaction::commit`] or
/// [`Transaction::close`]; dropping the handle closes it without
/// committing. `close` after `commit` is a no-op.
pub struct Transaction<'db> {
    db: &'db Db,
    snapshot: Option<Readable>,
    batch: Option<Batch>,
    write_guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Db, writable: bool) -> Result<Self> {
        let write_guard = if writable {
            Some(
                db.tx_lock
                    .lock()
                    .map_err(|_| Error::Io(io::Error::other("poisoned writer lock")))?,
            )
        } else {
            None
        };
        let snapshot = db.read_readable()?.clone();
        Ok(Self {
            db,
            snapshot: Some(snapshot),
            batch: writable.then(Batch::new_indexed),
            write_guard,
        })
    }

    fn snapshot(&self) -> Result<&Readable> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("transaction is closed"))
    }

    fn batch_mut(&mut self) -> Result<&mut Batch> {
        if self.snapshot.is_none() {
            return Err(Error::invalid_argument("transaction is closed"));
        }
        self.batch
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("write on a read-only transaction"))
    }

    /// Whether this transaction can write.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.batch.is_some() || self.write_guard.is_some()
    }

    // -- reads -------------------------------------------------------------

    /// Get the value for `key`, observing the snapshot merged with this
    /// transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an absent key, or the read error.
    pub fn get(&self, key: &[u8]) -> Result<Value> {
        let snapshot = self.snapshot()?;
        match self.db.get_at(key, snapshot, self.batch.as_ref(), false)? {
            Some(value) => Ok(Value::new(value)),
            None => Err(Error::NotFound),
        }
    }

    /// An iterator over the snapshot merged with this transaction's writes
    /// as of this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a closed transaction.
    pub fn new_iter(&self, opts: &IterOptions) -> Result<DbIterator> {
        let snapshot = self.snapshot()?;
        self.db
            .build_iter_at(snapshot, opts, self.batch.as_ref(), false)
    }

    // -- writes ------------------------------------------------------------

    /// Record a `SET` in the transaction's batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch_mut()?.set(key, value);
        Ok(())
    }

    /// Record a point deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.batch_mut()?.delete(key);
        Ok(())
    }

    /// Record a single-shot deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn single_delete(&mut self, key: &[u8]) -> Result<()> {
        self.batch_mut()?.single_delete(key);
        Ok(())
    }

    /// Record a deletion carrying the expected shadowed size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn delete_sized(&mut self, key: &[u8], size: u32) -> Result<()> {
        self.batch_mut()?.delete_sized(key, size);
        Ok(())
    }

    /// Record a merge operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch_mut()?.merge(key, value);
        Ok(())
    }

    /// Record an opaque WAL-only payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a read-only or closed
    /// transaction.
    pub fn log_data(&mut self, data: &[u8]) -> Result<()> {
        self.batch_mut()?.log_data(data);
        Ok(())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Commit and close the transaction.
    ///
    /// Runs the counter protocol (advance the store, advance the trusted
    /// source), then applies the batch atomically. The transaction is
    /// closed whether or not the commit succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for read-only or closed
    /// transactions, or the commit error. If the trusted-source call fails,
    /// the store counter is already advanced and re-syncs on the next
    /// successful commit; the batch is not applied.
    pub fn commit(&mut self) -> Result<()> {
        if self.snapshot.is_none() {
            return Err(Error::invalid_argument("transaction is closed"));
        }
        let Some(mut batch) = self.batch.take() else {
            self.close();
            return Err(Error::invalid_argument(
                "commit on a read-only transaction",
            ));
        };
        let result = self
            .db
            .advance_counter_for_commit()
            .and_then(|()| self.db.apply_batch(&mut batch, SYNC));
        self.close();
        result
    }

    /// Close without committing; the batch, if any, is discarded.
    /// Idempotent, including after [`Transaction::commit`].
    pub fn close(&mut self) {
        self.batch = None;
        self.snapshot = None;
        self.write_guard = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
