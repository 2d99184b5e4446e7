//! Error-injecting filesystem wrapper for failure-path tests.
//!
//! Wraps another [`Fs`] and fails every operation once the injection budget
//! is exhausted. Counting down lets a test sweep "fail the N-th I/O" without
//! knowing the engine's exact call sequence.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::vfs::{DirLock, File, Fs};

/// Filesystem that starts failing after a configured number of operations.
pub struct ErrorFs {
    inner: Arc<dyn Fs>,
    budget: Arc<AtomicI64>,
}

impl ErrorFs {
    /// Wrap `inner`, allowing `budget` operations before injection starts.
    #[must_use]
    pub fn new(inner: Arc<dyn Fs>, budget: i64) -> Self {
        Self {
            inner,
            budget: Arc::new(AtomicI64::new(budget)),
        }
    }

    /// Remaining operations before injection starts (negative once failing).
    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }

    fn charge(budget: &AtomicI64) -> Result<()> {
        if budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(Error::Io(io::Error::other("injected error")));
        }
        Ok(())
    }
}

struct ErrorFile {
    inner: Box<dyn File>,
    budget: Arc<AtomicI64>,
}

impl File for ErrorFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        ErrorFs::charge(&self.budget)?;
        self.inner.read_at(buf, offset)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        ErrorFs::charge(&self.budget)?;
        self.inner.write(data)
    }

    fn write_approved(&mut self, data: &[u8]) -> Result<()> {
        ErrorFs::charge(&self.budget)?;
        self.inner.write_approved(data)
    }

    fn sync(&mut self) -> Result<()> {
        ErrorFs::charge(&self.budget)?;
        self.inner.sync()
    }
}

impl Fs for ErrorFs {
    fn create(&self, path: &str) -> Result<Box<dyn File>> {
        Self::charge(&self.budget)?;
        Ok(Box::new(ErrorFile {
            inner: self.inner.create(path)?,
            budget: Arc::clone(&self.budget),
        }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>> {
        Self::charge(&self.budget)?;
        Ok(Box::new(ErrorFile {
            inner: self.inner.open(path)?,
            budget: Arc::clone(&self.budget),
        }))
    }

    fn open_read_write(&self, path: &str) -> Result<Box<dyn File>> {
        Self::charge(&self.budget)?;
        Ok(Box::new(ErrorFile {
            inner: self.inner.open_read_write(path)?,
            budget: Arc::clone(&self.budget),
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        Self::charge(&self.budget)?;
        self.inner.remove(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.inner.list(dir)
    }

    fn lock(&self, path: &str) -> Result<Box<dyn DirLock>> {
        self.inner.lock(path)
    }

    fn mkdir_all(&self, dir: &str) -> Result<()> {
        self.inner.mkdir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    #[test]
    fn operations_fail_after_budget_is_spent() {
        let fs = ErrorFs::new(Arc::new(MemFs::new()), 2);
        let mut file = fs.create("a").expect("first op within budget");
        file.write(b"x").expect("second op within budget");
        let err = file.write(b"y").expect_err("third op should fail");
        assert!(format!("{err}").contains("injected error"));
        assert!(fs.remaining() < 0);
    }

    #[test]
    fn zero_budget_fails_immediately() {
        let fs = ErrorFs::new(Arc::new(MemFs::new()), 0);
        assert!(fs.create("a").is_err());
    }
}
