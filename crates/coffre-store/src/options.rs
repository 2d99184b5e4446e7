//! Store configuration.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use coffre_crypto_core::MasterKey;

use crate::error::Result;
use crate::vfs::{DiskFs, Fs};

/// Callback that advances the caller's trusted monotonic counter.
///
/// Calling with `0` returns the current trusted value without modifying it;
/// any other value sets the counter and returns the previous value. The
/// provider is expected to serialize calls globally.
pub type SetMonotonicCounterFn = dyn Fn(u64) -> Result<u64> + Send + Sync;

/// On-disk format generation. Recorded in the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatMajorVersion(pub u64);

/// The newest format generation this build writes and reads.
pub const FORMAT_MAJOR_VERSION_CURRENT: FormatMajorVersion = FormatMajorVersion(1);

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Per-level block compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Store blocks uncompressed.
    None,
    /// Snappy, applied before encryption.
    #[default]
    Snappy,
    /// Recognized but rejected at runtime.
    Zstd,
}

/// Per-level tuning.
#[derive(Clone, Copy, Debug)]
pub struct LevelOptions {
    /// Target uncompressed size of a data block.
    pub block_size: usize,
    /// Block compression, applied before encryption.
    pub compression: Compression,
}

impl Default for LevelOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            compression: Compression::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Log sink for the engine.
///
/// The default implementation forwards to the `log` crate. `fatal` is used
/// for conditions the engine cannot continue from, such as a trusted counter
/// that advanced underneath the store.
pub trait Logger: Send + Sync {
    /// Informational message.
    fn info(&self, msg: &str);

    /// A condition worth an operator's attention.
    fn warn(&self, msg: &str);

    /// Unrecoverable condition. Must not return.
    fn fatal(&self, msg: &str) -> ! {
        log::error!("fatal: {msg}");
        panic!("{msg}");
    }
}

/// Logger that forwards to the `log` crate macros.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn info(&self, msg: &str) {
        log::info!("{msg}");
    }

    fn warn(&self, msg: &str) {
        log::warn!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for [`crate::Db::open`].
#[derive(Clone)]
pub struct Options {
    /// 128-bit master key. Required in production. When `None`, the store
    /// runs in the explicit test-only mode with an ephemeral random key:
    /// files are still encrypted, but unreadable after the process exits.
    pub encryption_key: Option<MasterKey>,

    /// Filesystem abstraction. Defaults to the OS filesystem.
    pub fs: Arc<dyn Fs>,

    /// Directory for WAL files. Defaults to the main directory.
    pub wal_dir: Option<String>,

    /// Per-level tuning. Level 0 is used for flushed tables.
    pub levels: Vec<LevelOptions>,

    /// Log sink.
    pub logger: Arc<dyn Logger>,

    /// Trusted monotonic counter callback; `None` disables rollback
    /// protection.
    pub set_monotonic_counter: Option<Arc<SetMonotonicCounterFn>>,

    /// Format generation to write.
    pub format_major_version: FormatMajorVersion,

    /// Memtable size that triggers an automatic flush at commit.
    pub memtable_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            encryption_key: None,
            fs: Arc::new(DiskFs),
            wal_dir: None,
            levels: vec![LevelOptions::default()],
            logger: Arc::new(DefaultLogger),
            set_monotonic_counter: None,
            format_major_version: FORMAT_MAJOR_VERSION_CURRENT,
            memtable_size: 4 << 20,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("encryption_key", &self.encryption_key)
            .field("wal_dir", &self.wal_dir)
            .field("levels", &self.levels)
            .field("format_major_version", &self.format_major_version)
            .field("memtable_size", &self.memtable_size)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// The tuning for level-0 tables.
    #[must_use]
    pub fn level0(&self) -> LevelOptions {
        self.levels.first().copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Write and iterator options
// ---------------------------------------------------------------------------

/// Per-write durability options.
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    /// Whether to fsync the WAL before the write is acknowledged.
    pub sync: bool,
}

/// Sync the WAL before acknowledging the write.
pub const SYNC: WriteOptions = WriteOptions { sync: true };

/// Acknowledge the write without waiting for the WAL fsync.
pub const NO_SYNC: WriteOptions = WriteOptions { sync: false };

impl Default for WriteOptions {
    fn default() -> Self {
        SYNC
    }
}

/// Options for [`crate::Db::new_iter`].
#[derive(Clone, Default)]
pub struct IterOptions {
    /// Inclusive lower bound on user keys.
    pub lower_bound: Option<Vec<u8>>,
    /// Exclusive upper bound on user keys.
    pub upper_bound: Option<Vec<u8>>,
    /// Cooperative cancellation token. When set, the next positioning call
    /// surfaces [`crate::Error::Cancelled`].
    pub cancel: Option<Arc<AtomicBool>>,
}
