//! Engine assembly: open/close, the commit pipeline, flushes, and reads.

use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use coffre_crypto_core::{zero_nonce, MasterKey, SealKey};

use crate::base::InternalKey;
use crate::batch::{decode_entries, decode_header, Batch};
use crate::counter::{decode_counter, encode_counter, reconcile, Reconciliation, MONOTONIC_COUNTER_KEY};
use crate::error::{Error, Result};
use crate::iterator::{DbIterator, InternalIter, VecIter};
use crate::keychain::KeyManager;
use crate::manifest::{
    manifest_filename, options_filename, parse_manifest_filename, table_filename, wal_filename,
    ManifestState, TableMeta, VersionEdit, CURRENT_FILENAME,
};
use crate::memtable::Memtable;
use crate::options::{IterOptions, Logger, Options, WriteOptions, SYNC};
use crate::record;
use crate::sstable::reader::Reader as TableReader;
use crate::sstable::writer::Writer as TableWriter;
use crate::transaction::Transaction;
use crate::vfs::{DirLock, Fs};

/// Name of the advisory lock file.
pub const LOCK_FILENAME: &str = "LOCK";

// ---------------------------------------------------------------------------
// Value guard
// ---------------------------------------------------------------------------

/// A value returned by a read. The backing buffer is released when the
/// guard is dropped (or explicitly [`Value::close`]d).
#[derive(Debug)]
pub struct Value {
    data: Vec<u8>,
}

impl Value {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Release the backing buffer.
    pub fn close(self) {}
}

impl Deref for Value {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// An immutable set of level-0 tables, oldest first.
pub(crate) struct Version {
    pub(crate) tables: Vec<Arc<TableReader>>,
}

/// The read-path view: replaced atomically on flush, cloned by snapshots.
#[derive(Clone)]
pub(crate) struct Readable {
    pub(crate) memtable: Arc<Memtable>,
    pub(crate) version: Arc<Version>,
    pub(crate) visible_seq: u64,
}

/// Write-path state, serialized by one mutex (the commit pipeline).
struct DbInner {
    wal: record::Writer,
    wal_file_num: u64,
    manifest: record::Writer,
    next_file_num: u64,
    last_seq: u64,
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

/// An open store.
///
/// Safe for concurrent reads and one concurrent writer; write transactions
/// serialize on an internal mutex.
pub struct Db {
    opts: Options,
    fs: Arc<dyn Fs>,
    dirname: String,
    wal_dirname: String,
    logger: Arc<dyn Logger>,
    key_manager: Arc<KeyManager>,
    inner: Mutex<DbInner>,
    readable: RwLock<Readable>,
    pub(crate) tx_lock: Mutex<()>,
    monotonic_counter: AtomicU64,
    _dir_lock: Box<dyn DirLock>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dirname", &self.dirname)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Open (or create) the store in `dirname`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKeySize`] if the configured key is malformed.
    /// - [`Error::InvalidMac`] if the salt chain fails verification or a
    ///   live file has no salt entry.
    /// - [`Error::RollbackDetected`] if the stored counter is behind the
    ///   trusted source.
    /// - [`Error::Corruption`] / [`Error::Io`] for damaged or unreadable
    ///   files.
    pub fn open(dirname: &str, opts: &Options) -> Result<Self> {
        let opts = opts.clone();
        let fs = Arc::clone(&opts.fs);
        let logger = Arc::clone(&opts.logger);
        let wal_dirname = opts.wal_dir.clone().unwrap_or_else(|| dirname.to_string());

        fs.mkdir_all(dirname)?;
        fs.mkdir_all(&wal_dirname)?;
        let dir_lock = fs.lock(&fs.path_join(dirname, LOCK_FILENAME))?;

        let master_key = match &opts.encryption_key {
            Some(key) => key.clone(),
            None => {
                logger.warn(
                    "no encryption key configured; using an ephemeral random key (test-only mode)",
                );
                MasterKey::random()
            }
        };
        let key_manager = Arc::new(KeyManager::open(&fs, dirname, master_key)?);

        let current_path = fs.path_join(dirname, CURRENT_FILENAME);
        let db = if fs.exists(&current_path) {
            Self::open_existing(dirname, wal_dirname, opts, fs, logger, key_manager, dir_lock)?
        } else {
            Self::create_fresh(dirname, wal_dirname, opts, fs, logger, key_manager, dir_lock)?
        };

        db.remove_stale_options_files();
        db.verify_freshness()?;
        Ok(db)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_fresh(
        dirname: &str,
        wal_dirname: String,
        opts: Options,
        fs: Arc<dyn Fs>,
        logger: Arc<dyn Logger>,
        key_manager: Arc<KeyManager>,
        dir_lock: Box<dyn DirLock>,
    ) -> Result<Self> {
        let mut state = ManifestState::default();
        state.format_major_version = opts.format_major_version.0;

        let manifest_num = state.next_file_num;
        let wal_num = manifest_num + 1;
        let options_num = manifest_num + 2;
        state.next_file_num = manifest_num + 3;
        state.log_num = wal_num;

        // Manifest first: its key must exist before the file does.
        let manifest_key = key_manager.create(manifest_num)?;
        let manifest_file = fs.create(&fs.path_join(dirname, &manifest_filename(manifest_num)))?;
        let mut manifest = record::Writer::new(manifest_file, &manifest_key)?;

        let wal_key = key_manager.create(wal_num)?;
        let wal_file = fs.create(&fs.path_join(&wal_dirname, &wal_filename(wal_num)))?;
        let wal = record::Writer::new(wal_file, &wal_key)?;

        write_options_file(&fs, &key_manager, dirname, options_num, &opts)?;

        let edit = VersionEdit {
            log_num: Some(wal_num),
            next_file_num: Some(state.next_file_num),
            last_seq_num: Some(state.last_seq_num),
            format_major_version: Some(state.format_major_version),
            new_tables: Vec::new(),
        };
        manifest.append(&edit.encode()?)?;
        manifest.sync()?;

        // CURRENT last, making the new manifest live.
        let mut current = fs.create(&fs.path_join(dirname, CURRENT_FILENAME))?;
        current.write(format!("{}\n", manifest_filename(manifest_num)).as_bytes())?;
        current.sync()?;

        Ok(Self {
            opts,
            fs,
            dirname: dirname.to_string(),
            wal_dirname,
            logger,
            key_manager,
            inner: Mutex::new(DbInner {
                wal,
                wal_file_num: wal_num,
                manifest,
                next_file_num: state.next_file_num,
                last_seq: state.last_seq_num,
            }),
            readable: RwLock::new(Readable {
                memtable: Arc::new(Memtable::new()),
                version: Arc::new(Version { tables: Vec::new() }),
                visible_seq: state.last_seq_num,
            }),
            tx_lock: Mutex::new(()),
            monotonic_counter: AtomicU64::new(0),
            _dir_lock: dir_lock,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn open_existing(
        dirname: &str,
        wal_dirname: String,
        opts: Options,
        fs: Arc<dyn Fs>,
        logger: Arc<dyn Logger>,
        key_manager: Arc<KeyManager>,
        dir_lock: Box<dyn DirLock>,
    ) -> Result<Self> {
        // Every encrypted file class is verified during open: the manifest
        // and WAL by replay, tables by their footer/index loads, and the
        // options dump explicitly below. A salt chain that was truncated
        // fails the corresponding key lookup.
        let manifest_name = read_current(fs.as_ref(), dirname)?;
        let manifest_num = parse_manifest_filename(&manifest_name)
            .ok_or_else(|| Error::corruption(format!("CURRENT names {manifest_name}")))?;
        let manifest_key = key_manager.get(manifest_num)?;

        let manifest_path = fs.path_join(dirname, &manifest_name);
        let mut state = ManifestState::default();
        let mut manifest_reader =
            record::Reader::new(fs.open(&manifest_path)?, &manifest_key)?;
        while let Some(chunk) = manifest_reader.next()? {
            state.apply(VersionEdit::decode(&chunk)?);
        }
        let manifest_chunks = manifest_reader.chunks_read();

        if state.format_major_version > opts.format_major_version.0 {
            return Err(Error::invalid_argument(format!(
                "store format generation {} is newer than supported {}",
                state.format_major_version, opts.format_major_version.0
            )));
        }

        // Open the live tables, newest-first priority comes later.
        let mut tables = Vec::with_capacity(state.tables.len());
        for meta in &state.tables {
            let table_key = key_manager.get(meta.file_num)?;
            let table_file = fs.open(&fs.path_join(dirname, &table_filename(meta.file_num)))?;
            tables.push(TableReader::open(table_file, &table_key, meta.file_num)?);
        }

        verify_options_file(fs.as_ref(), &key_manager, dirname, state.next_file_num)?;

        // Replay the live WAL into a fresh memtable.
        let memtable = Arc::new(Memtable::new());
        let mut last_seq = state.last_seq_num;
        let old_wal_num = state.log_num;
        let old_wal_path = fs.path_join(&wal_dirname, &wal_filename(old_wal_num));
        if fs.exists(&old_wal_path) {
            let wal_key = key_manager.get(old_wal_num)?;
            let mut wal_reader = record::Reader::new(fs.open(&old_wal_path)?, &wal_key)?;
            while let Some(chunk) = wal_reader.next()? {
                let (base, count) = decode_header(&chunk)?;
                let mut entries = decode_entries(&chunk)?;
                let mut i = 0u64;
                while let Some(entry) = entries.next()? {
                    let seq = base + i;
                    i += 1;
                    if entry.kind == crate::base::InternalKeyKind::LogData {
                        continue;
                    }
                    memtable.insert(entry.key, seq, entry.kind, entry.value)?;
                }
                if count > 0 {
                    last_seq = last_seq.max(base + u64::from(count) - 1);
                }
            }
        }

        // Rotate to a fresh WAL and record it, then retire the old one.
        let new_wal_num = state.next_file_num;
        let options_num = new_wal_num + 1;
        state.next_file_num = new_wal_num + 2;

        let wal_key = key_manager.create(new_wal_num)?;
        let wal_file = fs.create(&fs.path_join(&wal_dirname, &wal_filename(new_wal_num)))?;
        let wal = record::Writer::new(wal_file, &wal_key)?;

        write_options_file(&fs, &key_manager, dirname, options_num, &opts)?;

        let manifest_file = fs.open_read_write(&manifest_path)?;
        let mut manifest = record::Writer::resume(manifest_file, &manifest_key, manifest_chunks)?;
        let edit = VersionEdit {
            log_num: Some(new_wal_num),
            next_file_num: Some(state.next_file_num),
            last_seq_num: Some(last_seq),
            format_major_version: None,
            new_tables: Vec::new(),
        };
        manifest.append(&edit.encode()?)?;
        manifest.sync()?;

        if fs.exists(&old_wal_path) {
            fs.remove(&old_wal_path)?;
        }

        Ok(Self {
            opts,
            fs,
            dirname: dirname.to_string(),
            wal_dirname,
            logger,
            key_manager,
            inner: Mutex::new(DbInner {
                wal,
                wal_file_num: new_wal_num,
                manifest,
                next_file_num: state.next_file_num,
                last_seq,
            }),
            readable: RwLock::new(Readable {
                memtable,
                version: Arc::new(Version { tables }),
                visible_seq: last_seq,
            }),
            tx_lock: Mutex::new(()),
            monotonic_counter: AtomicU64::new(0),
            _dir_lock: dir_lock,
        })
    }

    /// Sync and close the store. Outstanding data lives in the WAL and is
    /// replayed on the next open; the memtable is not flushed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final syncs fail.
    pub fn close(self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        inner.wal.sync()?;
        inner.manifest.sync()?;
        Ok(())
    }

    // -- writes ------------------------------------------------------------

    /// Set `key` to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the WAL write or fsync fails; the engine
    /// stays usable.
    pub fn set(&self, key: &[u8], value: &[u8], write_opts: WriteOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.apply_batch(&mut batch, write_opts)
    }

    /// Delete `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the WAL write or fsync fails.
    pub fn delete(&self, key: &[u8], write_opts: WriteOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.apply_batch(&mut batch, write_opts)
    }

    /// Merge `value` into `key` (operands concatenate oldest-first).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the WAL write or fsync fails.
    pub fn merge(&self, key: &[u8], value: &[u8], write_opts: WriteOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.merge(key, value);
        self.apply_batch(&mut batch, write_opts)
    }

    /// Apply a batch through the commit pipeline: WAL append (and fsync per
    /// `write_opts`), memtable insertion with freshly assigned sequence
    /// numbers, then atomic publication.
    pub(crate) fn apply_batch(&self, batch: &mut Batch, write_opts: WriteOptions) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock_inner()?;
        let base = inner.last_seq + 1;
        let count = u64::from(batch.count());
        let payload = batch.encode(base).to_vec();

        inner.wal.append(&payload)?;
        if write_opts.sync {
            inner.wal.sync()?;
        }

        let memtable = Arc::clone(&self.read_readable()?.memtable);
        let mut entries = decode_entries(&payload)?;
        let mut i = 0u64;
        while let Some(entry) = entries.next()? {
            let seq = base + i;
            i += 1;
            if entry.kind == crate::base::InternalKeyKind::LogData {
                continue;
            }
            memtable.insert(entry.key, seq, entry.kind, entry.value)?;
        }
        inner.last_seq = base + count - 1;

        {
            let mut readable = self.write_readable()?;
            readable.visible_seq = inner.last_seq;
        }

        if memtable.approximate_size() >= self.opts.memtable_size {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Flush the memtable into a level-0 table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] / [`Error::Corruption`] if writing or
    /// re-opening the table fails.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut MutexGuard<'_, DbInner>) -> Result<()> {
        let (memtable, version) = {
            let readable = self.read_readable()?;
            (Arc::clone(&readable.memtable), Arc::clone(&readable.version))
        };
        if memtable.is_empty() {
            return Ok(());
        }

        // New file: key first (the salt block is fsynced before the file
        // materializes), then the encrypted bytes, then the manifest entry.
        let table_num = inner.next_file_num;
        inner.next_file_num += 1;
        let table_key = self.key_manager.create(table_num)?;
        let table_path = self.fs.path_join(&self.dirname, &table_filename(table_num));
        let level = self.opts.level0();
        let mut writer = TableWriter::new(
            self.fs.create(&table_path)?,
            &table_key,
            level.block_size,
            level.compression,
            self.opts.format_major_version.0 as u32,
        )?;
        for (key, value) in memtable.collect_all()? {
            writer.add(&key, &value)?;
        }
        let written = writer.finish()?;
        let reader = TableReader::open(self.fs.open(&table_path)?, &table_key, table_num)?;

        // Rotate the WAL; everything in the old log is now in the table.
        let new_wal_num = inner.next_file_num;
        inner.next_file_num += 1;
        let wal_key = self.key_manager.create(new_wal_num)?;
        let wal_path = self.fs.path_join(&self.wal_dirname, &wal_filename(new_wal_num));
        let new_wal = record::Writer::new(self.fs.create(&wal_path)?, &wal_key)?;

        let edit = VersionEdit {
            log_num: Some(new_wal_num),
            next_file_num: Some(inner.next_file_num),
            last_seq_num: Some(inner.last_seq),
            format_major_version: None,
            new_tables: vec![TableMeta {
                file_num: table_num,
                size: written.size,
                num_entries: written.num_entries,
                smallest: written.smallest,
                largest: written.largest,
            }],
        };
        inner.manifest.append(&edit.encode()?)?;
        inner.manifest.sync()?;

        let old_wal_num = inner.wal_file_num;
        inner.wal = new_wal;
        inner.wal_file_num = new_wal_num;

        {
            let mut readable = self.write_readable()?;
            let mut tables = version.tables.clone();
            tables.push(reader);
            readable.version = Arc::new(Version { tables });
            readable.memtable = Arc::new(Memtable::new());
        }

        let old_wal_path = self.fs.path_join(&self.wal_dirname, &wal_filename(old_wal_num));
        let _ = self.fs.remove(&old_wal_path);
        Ok(())
    }

    // -- reads -------------------------------------------------------------

    /// Get the value for `key`. The returned guard keeps the buffer alive
    /// until dropped (or [`Value::close`]d).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an absent key, or the read error.
    pub fn get(&self, key: &[u8]) -> Result<Value> {
        let readable = self.read_readable()?.clone();
        match self.get_at(key, &readable, None, false)? {
            Some(value) => Ok(Value::new(value)),
            None => Err(Error::NotFound),
        }
    }

    /// Scoped read: runs `f` on the value and releases the buffer before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an absent key, or the read error.
    pub fn get_with<T>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let value = self.get(key)?;
        Ok(f(&value))
    }

    /// Point lookup against a fixed readable state.
    pub(crate) fn get_at(
        &self,
        key: &[u8],
        readable: &Readable,
        batch: Option<&Batch>,
        include_reserved: bool,
    ) -> Result<Option<Vec<u8>>> {
        let mut successor = key.to_vec();
        successor.push(0);
        let bounds = IterOptions {
            lower_bound: Some(key.to_vec()),
            upper_bound: Some(successor),
            cancel: None,
        };
        let mut iter = self.build_iter_at(readable, &bounds, batch, include_reserved)?;
        if iter.seek_ge(key) && iter.key() == key {
            let value = iter.value().to_vec();
            iter.close()?;
            return Ok(Some(value));
        }
        iter.close()?;
        Ok(None)
    }

    /// An iterator over the current state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the engine state is unreadable.
    pub fn new_iter(&self, opts: &IterOptions) -> Result<DbIterator> {
        let readable = self.read_readable()?.clone();
        self.build_iter_at(&readable, opts, None, false)
    }

    /// Build an iterator over a fixed readable state, optionally overlaying
    /// an indexed batch.
    pub(crate) fn build_iter_at(
        &self,
        readable: &Readable,
        opts: &IterOptions,
        batch: Option<&Batch>,
        include_reserved: bool,
    ) -> Result<DbIterator> {
        let mut children: Vec<Box<dyn InternalIter>> = Vec::new();
        if let Some(batch) = batch {
            children.push(Box::new(VecIter::new(batch.indexed_entries())));
        }

        let lower_ik = opts
            .lower_bound
            .as_ref()
            .map(|k| InternalKey::search_key(k.clone()).encode());
        let upper_ik = opts
            .upper_bound
            .as_ref()
            .map(|k| InternalKey::search_key(k.clone()).encode());
        children.push(Box::new(VecIter::new(
            readable
                .memtable
                .collect_range(lower_ik.as_deref(), upper_ik.as_deref())?,
        )));

        for table in readable.version.tables.iter().rev() {
            children.push(Box::new(table.iter()));
        }

        Ok(DbIterator::new(
            children,
            readable.visible_seq,
            opts.lower_bound.clone(),
            opts.upper_bound.clone(),
            opts.cancel.clone(),
            include_reserved,
        ))
    }

    /// Start a transaction. Read transactions run concurrently; a writable
    /// transaction blocks here until the current writer closes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the engine state is unreadable.
    pub fn new_transaction(&self, writable: bool) -> Result<Transaction<'_>> {
        Transaction::new(self, writable)
    }

    // -- monotonic counter -------------------------------------------------

    /// Open-time freshness check against the trusted counter source.
    fn verify_freshness(&self) -> Result<()> {
        let Some(set_counter) = &self.opts.set_monotonic_counter else {
            return Ok(());
        };
        let source = set_counter(0)?;
        let store = self.read_stored_counter()?;
        match reconcile(store, source) {
            Reconciliation::Rollback => {
                return Err(Error::RollbackDetected { store, trusted: source });
            }
            Reconciliation::SourceLags => {
                self.logger.info(&format!(
                    "WARNING: open: monotonic counter source lags behind: \
                     store counter: {store}, source counter: {source}"
                ));
                // Re-synced on the next commit.
            }
            Reconciliation::InSync => {}
        }
        self.monotonic_counter.store(store, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn read_stored_counter(&self) -> Result<u64> {
        let readable = self.read_readable()?.clone();
        match self.get_at(MONOTONIC_COUNTER_KEY, &readable, None, true)? {
            Some(value) => decode_counter(&value),
            None => Ok(0),
        }
    }

    /// Commit-side counter protocol: advance the store, then the trusted
    /// source, before the guarded batch is applied. A failure after the
    /// store advanced leaves the source lagging, which the next successful
    /// commit repairs.
    pub(crate) fn advance_counter_for_commit(&self) -> Result<()> {
        let Some(set_counter) = &self.opts.set_monotonic_counter else {
            return Ok(());
        };
        let current = self.monotonic_counter.load(AtomicOrdering::SeqCst);
        let next = current + 1;

        let mut batch = Batch::new();
        batch.set(MONOTONIC_COUNTER_KEY, &encode_counter(next));
        self.apply_batch(&mut batch, SYNC)?;
        self.monotonic_counter.store(next, AtomicOrdering::SeqCst);

        let previous = set_counter(next)?;
        if previous > current {
            self.logger.fatal(&format!(
                "monotonic counter of trusted source was advanced concurrently: \
                 source counter: {previous}, store counter: {current}"
            ));
        }
        if previous < current {
            self.logger.warn(&format!(
                "monotonic counter source lagged behind and was re-synced: \
                 source counter: {previous}, store counter: {current}"
            ));
        }
        Ok(())
    }

    // -- plumbing ----------------------------------------------------------

    pub(crate) fn read_readable(&self) -> Result<std::sync::RwLockReadGuard<'_, Readable>> {
        self.readable
            .read()
            .map_err(|_| Error::Io(io::Error::other("poisoned read-state lock")))
    }

    fn write_readable(&self) -> Result<std::sync::RwLockWriteGuard<'_, Readable>> {
        self.readable
            .write()
            .map_err(|_| Error::Io(io::Error::other("poisoned read-state lock")))
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, DbInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned commit pipeline lock")))
    }

    fn remove_stale_options_files(&self) {
        // Old OPTIONS files are superseded at every open; their keys remain
        // in the salt chain but the files are garbage.
        let Ok(names) = self.fs.list(&self.dirname) else {
            return;
        };
        let current = {
            let inner = self.inner.lock().ok();
            inner.map(|inner| inner.next_file_num)
        };
        let Some(next_file_num) = current else { return };
        for name in names {
            if let Some(num) = name.strip_prefix("OPTIONS-").and_then(|n| n.parse::<u64>().ok()) {
                if num + 1 < next_file_num {
                    let _ = self.fs.remove(&self.fs.path_join(&self.dirname, &name));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_current(fs: &dyn Fs, dirname: &str) -> Result<String> {
    let file = fs.open(&fs.path_join(dirname, CURRENT_FILENAME))?;
    let size = file.size()?;
    if size == 0 || size > 256 {
        return Err(Error::corruption("CURRENT is malformed"));
    }
    let mut buf = vec![0u8; size as usize];
    file.read_exact_at(&mut buf, 0)?;
    let name = String::from_utf8(buf)
        .map_err(|_| Error::corruption("CURRENT is not valid UTF-8"))?;
    Ok(name.trim_end().to_string())
}

/// Authenticate the newest options dump left by the previous session.
fn verify_options_file(
    fs: &dyn Fs,
    key_manager: &Arc<KeyManager>,
    dirname: &str,
    next_file_num: u64,
) -> Result<()> {
    let newest = fs
        .list(dirname)?
        .into_iter()
        .filter_map(|name| {
            name.strip_prefix("OPTIONS-")
                .and_then(|n| n.parse::<u64>().ok())
        })
        .filter(|&num| num < next_file_num)
        .max();
    let Some(file_num) = newest else {
        return Ok(());
    };

    let key = key_manager.get(file_num)?;
    let seal = SealKey::new(&key)?;
    let file = fs.open(&fs.path_join(dirname, &options_filename(file_num)))?;
    let size = file.size()?;
    let mut sealed = vec![0u8; size as usize];
    file.read_exact_at(&mut sealed, 0)?;
    seal.open_in_place(zero_nonce(), &mut sealed)
        .map_err(|e| crate::sstable::backing_file_error(file_num, &e))?;
    Ok(())
}

/// Seal the textual options dump with the all-zero nonce (the file key is
/// unique to this file number, so the fixed nonce is safe).
fn write_options_file(
    fs: &Arc<dyn Fs>,
    key_manager: &Arc<KeyManager>,
    dirname: &str,
    file_num: u64,
    opts: &Options,
) -> Result<()> {
    let key = key_manager.create(file_num)?;
    let seal = SealKey::new(&key)?;
    let level = opts.level0();
    let dump = format!(
        "[Options]\n  format_major_version={}\n  wal_dir={}\n\n[Level \"0\"]\n  block_size={}\n  compression={:?}\n",
        opts.format_major_version.0,
        opts.wal_dir.as_deref().unwrap_or(""),
        level.block_size,
        level.compression,
    );
    let mut sealed = dump.into_bytes();
    seal.seal_in_place(zero_nonce(), &mut sealed)?;
    let mut file = fs.create(&fs.path_join(dirname, &options_filename(file_num)))?;
    file.write_approved(&sealed)?;
    file.sync()?;
    Ok(())
}
