//! COFFRE — an embedded, single-process, ordered key-value store with
//! cryptographically enforced confidentiality, per-file integrity, and
//! anti-rollback protection.
//!
//! The store is built for confidential computing environments where the
//! filesystem is untrusted: a host may read, modify, delete, reorder,
//! substitute, or roll back persisted files, and the engine must detect it
//! or refuse to serve the data. Every data file (tables, WAL, manifest,
//! options) is sealed with AES-128-GCM under a per-file key derived from
//! the master key via HKDF; per-file salts live in a MAC-chained,
//! append-only `SALTCHAIN` file; and a monotonic counter mirrored in a
//! caller-supplied trusted source detects rollback of the whole directory.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coffre_store::{Db, MasterKey, MemFs, Options};
//!
//! # fn main() -> coffre_store::Result<()> {
//! let opts = Options {
//!     encryption_key: Some(MasterKey::new(&[0x02; 16])?),
//!     fs: Arc::new(MemFs::new()),
//!     ..Options::default()
//! };
//! let db = Db::open("", &opts)?;
//! db.set(b"hello", b"world", coffre_store::SYNC)?;
//! let value = db.get(b"hello")?;
//! assert_eq!(&*value, b"world");
//! drop(value);
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod base;
pub mod batch;
pub mod counter;
pub mod db;
pub mod error;
pub mod iterator;
pub mod keychain;
pub mod manifest;
pub mod memtable;
pub mod options;
pub mod record;
pub mod sstable;
pub mod transaction;
mod varint;
pub mod vfs;

pub use coffre_crypto_core::MasterKey;
pub use db::{Db, Value, LOCK_FILENAME};
pub use error::{Error, Result};
pub use iterator::DbIterator;
pub use keychain::SALT_CHAIN_FILENAME;
pub use options::{
    Compression, DefaultLogger, FormatMajorVersion, IterOptions, LevelOptions, Logger, Options,
    SetMonotonicCounterFn, WriteOptions, NO_SYNC, SYNC,
};
pub use transaction::Transaction;
pub use vfs::{DiskFs, MemFs};
