//! Filesystem abstraction with the approved-write discipline.
//!
//! Every file exposes two write entry points:
//!
//! - [`File::write`] — plaintext. Layers above the crypto boundary may only
//!   emit through this method, and every such path is routed through a
//!   sealing wrapper before bytes reach a data file.
//! - [`File::write_approved`] — bytes that are already authenticated and
//!   framed (sealed blocks, salt-chain records). The crypto layers forward
//!   through this method after sealing; for the base filesystems it is the
//!   same append.
//!
//! The split is a type-level discipline: a code path holding only the
//! plaintext entry point cannot smuggle unencrypted bytes past the sealing
//! wrappers, because the wrappers own the approved side.
//!
//! All writes are appends; the store's file classes (WAL, manifest, tables,
//! salt chain) are append-only, and `CURRENT` is rewritten via `create`.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Seek, SeekFrom, Write as _};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

pub mod errorfs;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An open file. Reads are positional and shared; writes append.
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;

    /// Append plaintext. See the module docs for the discipline.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Append bytes that are already authenticated and framed.
    fn write_approved(&mut self, data: &[u8]) -> Result<()>;

    /// Flush file contents to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with `UnexpectedEof` if the file ends early.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of file",
                )));
            }
            filled += n;
        }
        Ok(())
    }
}

/// An advisory lock on a database directory. Released on drop.
pub trait DirLock: Send + Sync {}

/// A filesystem. Paths are plain strings joined with [`Fs::path_join`].
pub trait Fs: Send + Sync {
    /// Create (or truncate) a file for writing.
    fn create(&self, path: &str) -> Result<Box<dyn File>>;

    /// Open an existing file read-only.
    fn open(&self, path: &str) -> Result<Box<dyn File>>;

    /// Open a file for reading and appending, creating it if absent.
    fn open_read_write(&self, path: &str) -> Result<Box<dyn File>>;

    /// Remove a file.
    fn remove(&self, path: &str) -> Result<()>;

    /// Whether a file exists.
    fn exists(&self, path: &str) -> bool;

    /// List the file names in a directory.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Take the advisory lock file at `path`.
    fn lock(&self, path: &str) -> Result<Box<dyn DirLock>>;

    /// Join a directory and a file name.
    fn path_join(&self, dir: &str, name: &str) -> String {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    /// Create the directory if it does not exist.
    fn mkdir_all(&self, dir: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemFs
// ---------------------------------------------------------------------------

type SharedBuf = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct MemFsInner {
    files: HashMap<String, SharedBuf>,
    locks: HashMap<String, ()>,
}

/// In-memory filesystem for tests and ephemeral stores.
///
/// Files are shared buffers: handles opened before and after a write observe
/// the same bytes, and tests can inspect or corrupt raw file contents through
/// [`MemFs::read_file`] / [`MemFs::put_file`].
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

impl MemFs {
    /// Create an empty in-memory filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a file's raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file does not exist.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let inner = lock_poisoned(&self.inner)?;
        let buf = inner.files.get(path).ok_or_else(|| not_found(path))?;
        let data = lock_poisoned(buf)?;
        Ok(data.clone())
    }

    /// Replace a file's raw bytes, creating the file if absent.
    pub fn put_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut inner = lock_poisoned(&self.inner)?;
        let buf = inner.files.entry(path.to_string()).or_default();
        *lock_poisoned(buf)? = data;
        Ok(())
    }
}

fn not_found(path: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {path}"),
    ))
}

fn lock_poisoned<'a, T>(m: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| Error::Io(io::Error::other("poisoned filesystem lock")))
}

struct MemFile {
    buf: SharedBuf,
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = lock_poisoned(&self.buf)?;
        let offset = usize::try_from(offset)
            .map_err(|_| Error::Io(io::Error::other("offset out of range")))?;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        Ok(lock_poisoned(&self.buf)?.len() as u64)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        lock_poisoned(&self.buf)?.extend_from_slice(data);
        Ok(())
    }

    fn write_approved(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemLock {
    fs: Arc<Mutex<MemFsInner>>,
    path: String,
}

impl DirLock for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.fs.lock() {
            inner.locks.remove(&self.path);
        }
    }
}

impl Fs for MemFs {
    fn create(&self, path: &str) -> Result<Box<dyn File>> {
        let mut inner = lock_poisoned(&self.inner)?;
        let buf: SharedBuf = Arc::new(Mutex::new(Vec::new()));
        inner.files.insert(path.to_string(), Arc::clone(&buf));
        Ok(Box::new(MemFile { buf }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>> {
        let inner = lock_poisoned(&self.inner)?;
        let buf = inner.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(MemFile { buf: Arc::clone(buf) }))
    }

    fn open_read_write(&self, path: &str) -> Result<Box<dyn File>> {
        let mut inner = lock_poisoned(&self.inner)?;
        let buf = inner
            .files
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        Ok(Box::new(MemFile { buf: Arc::clone(buf) }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut inner = lock_poisoned(&self.inner)?;
        inner.files.remove(path).ok_or_else(|| not_found(path))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.files.contains_key(path))
            .unwrap_or(false)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let inner = lock_poisoned(&self.inner)?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut names: Vec<String> = inner
            .files
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(&prefix)?;
                // Only direct children.
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn lock(&self, path: &str) -> Result<Box<dyn DirLock>> {
        let mut inner = lock_poisoned(&self.inner)?;
        if inner.locks.contains_key(path) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("lock already held: {path}"),
            )));
        }
        inner.locks.insert(path.to_string(), ());
        Ok(Box::new(MemLock {
            fs: Arc::clone(&self.inner),
            path: path.to_string(),
        }))
    }

    fn mkdir_all(&self, _dir: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DiskFs
// ---------------------------------------------------------------------------

/// Filesystem backed by `std::fs`.
#[derive(Clone, Copy, Default)]
pub struct DiskFs;

struct DiskFile {
    file: Mutex<fs::File>,
}

impl DiskFile {
    fn new(file: fs::File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl File for DiskFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let file = self
            .file
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned file lock")))?;
        Ok(file.read_at(buf, offset)?)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::io::Read;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned file lock")))?;
        let pos = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(buf)?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        let file = self
            .file
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned file lock")))?;
        Ok(file.metadata()?.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned file lock")))?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_approved(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)
    }

    fn sync(&mut self) -> Result<()> {
        let file = self
            .file
            .lock()
            .map_err(|_| Error::Io(io::Error::other("poisoned file lock")))?;
        file.sync_all()?;
        Ok(())
    }
}

struct DiskLock {
    path: String,
}

impl DirLock for DiskLock {}

impl Drop for DiskLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Fs for DiskFs {
    fn create(&self, path: &str) -> Result<Box<dyn File>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskFile::new(file)))
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>> {
        let file = fs::OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(DiskFile::new(file)))
    }

    fn open_read_write(&self, path: &str) -> Result<Box<dyn File>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Box::new(DiskFile::new(file)))
    }

    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        fs::metadata(path).is_ok()
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = if dir.is_empty() { "." } else { dir };
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock(&self, path: &str) -> Result<Box<dyn DirLock>> {
        // O_EXCL create: fails if another process holds the lock file.
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(DiskLock {
            path: path.to_string(),
        }))
    }

    fn mkdir_all(&self, dir: &str) -> Result<()> {
        if !dir.is_empty() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
