//! Encrypted chunked record log, shared by the WAL and the manifest.
//!
//! A log is a sequence of independently sealed chunks:
//!
//! ```text
//! chunk = LE32(ciphertext length) ‖ AES-GCM(FK, chunk_nonce(iv), payload)
//! ```
//!
//! The nonce counter `iv` starts at 0 for a fresh file and increments once
//! per sealed chunk; readers recompute it during replay, so no per-chunk
//! nonce is stored. A sealed chunk is exactly 16 bytes larger than its
//! payload. Reopening a log for append resumes the counter at the number of
//! chunks already present.

use coffre_crypto_core::{chunk_nonce, FileKey, SealKey, TAG_LEN};

use crate::error::{Error, Result};
use crate::vfs::File;

/// Width of the chunk length prefix.
const LEN_PREFIX: usize = 4;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Appends sealed chunks to a log file.
pub struct Writer {
    file: Box<dyn File>,
    seal: SealKey,
    iv: u64,
}

impl Writer {
    /// Start a writer on a fresh (empty) log file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cipher`] if the cipher cannot be constructed.
    pub fn new(file: Box<dyn File>, key: &FileKey) -> Result<Self> {
        Self::resume(file, key, 0)
    }

    /// Resume appending to a log whose first `iv` chunks already exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cipher`] if the cipher cannot be constructed.
    pub fn resume(file: Box<dyn File>, key: &FileKey, iv: u64) -> Result<Self> {
        Ok(Self {
            file,
            seal: SealKey::new(key)?,
            iv,
        })
    }

    /// Seal `payload` as the next chunk and append it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the append fails; the chunk may then be
    /// partially written and replay will stop at it.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let mut sealed = payload.to_vec();
        self.seal.seal_in_place(chunk_nonce(self.iv), &mut sealed)?;

        let len = u32::try_from(sealed.len())
            .map_err(|_| Error::invalid_argument("record payload too large"))?;
        let mut framed = Vec::with_capacity(LEN_PREFIX + sealed.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&sealed);

        self.file.write_approved(&framed)?;
        self.iv += 1;
        Ok(())
    }

    /// Flush appended chunks to stable storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the fsync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    /// Number of chunks written (the next nonce counter).
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.iv
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Replays sealed chunks from a log file.
pub struct Reader {
    file: Box<dyn File>,
    seal: SealKey,
    size: u64,
    offset: u64,
    iv: u64,
}

impl Reader {
    /// Open a reader at the start of the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cipher`] if the cipher cannot be constructed or
    /// [`Error::Io`] if the file size cannot be read.
    pub fn new(file: Box<dyn File>, key: &FileKey) -> Result<Self> {
        let size = file.size()?;
        Ok(Self {
            file,
            seal: SealKey::new(key)?,
            size,
            offset: 0,
            iv: 0,
        })
    }

    /// Decrypt and return the next chunk, or `None` at end of log.
    ///
    /// # Errors
    ///
    /// - [`Error::Corruption`] containing `invalid chunk` for a malformed
    ///   length prefix or truncated chunk.
    /// - [`Error::Corruption`] containing the cipher literal for a chunk
    ///   that fails authentication.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.offset == self.size {
            return Ok(None);
        }
        let remaining = self.size - self.offset;
        if remaining < LEN_PREFIX as u64 {
            return Err(Error::corruption("invalid chunk: truncated length prefix"));
        }

        let mut len_buf = [0u8; LEN_PREFIX];
        self.file.read_exact_at(&mut len_buf, self.offset)?;
        let len = u64::from(u32::from_le_bytes(len_buf));
        if len < TAG_LEN as u64 || len > remaining - LEN_PREFIX as u64 {
            return Err(Error::corruption(format!(
                "invalid chunk: length {len} exceeds remaining log"
            )));
        }

        let mut sealed = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut sealed, self.offset + LEN_PREFIX as u64)?;
        let plain = self
            .seal
            .open_in_place(chunk_nonce(self.iv), &mut sealed)
            .map_err(Error::from)?
            .to_vec();

        self.offset += LEN_PREFIX as u64 + len;
        self.iv += 1;
        Ok(Some(plain))
    }

    /// Number of chunks replayed so far.
    #[must_use]
    pub const fn chunks_read(&self) -> u64 {
        self.iv
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
