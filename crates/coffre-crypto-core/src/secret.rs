//! Zeroizing wrappers for key material.
//!
//! This module provides:
//! - [`MasterKey`] — the 128-bit secret supplied by the application at open
//! - [`FileKey`] — a 128-bit per-file key derived from the master key
//!
//! Both types zeroize on drop and mask their `Debug` output. The master key
//! only ever resides in memory; it is never persisted.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key length in bytes for the master key, file keys, and AES-128-GCM.
pub const KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// MasterKey
// ---------------------------------------------------------------------------

/// The 128-bit master secret. All file keys are derived from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Wrap caller-supplied key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeySize`] unless `bytes` is exactly
    /// 16 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeySize(bytes.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Generate an ephemeral random master key.
    ///
    /// This exists for the explicit test-only mode where no key is
    /// configured: the store still encrypts everything, but the key is lost
    /// when the process exits.
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    /// Expose the raw bytes for a cryptographic operation.
    #[must_use]
    pub const fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(***)")
    }
}

// ---------------------------------------------------------------------------
// FileKey
// ---------------------------------------------------------------------------

/// A per-file encryption key derived from the master key and a file salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    bytes: [u8; KEY_LEN],
}

impl FileKey {
    /// Expose the raw bytes for a cryptographic operation.
    #[must_use]
    pub const fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl From<[u8; KEY_LEN]> for FileKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(***)")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_accepts_16_bytes() {
        let key = MasterKey::new(&[0x02; 16]).expect("16-byte key should be accepted");
        assert_eq!(key.expose(), &[0x02; 16]);
    }

    #[test]
    fn master_key_rejects_short_key() {
        let err = MasterKey::new(&[0u8; 15]).expect_err("15-byte key should be rejected");
        assert!(matches!(err, CryptoError::InvalidKeySize(15)));
        assert!(format!("{err}").contains("invalid key size"));
    }

    #[test]
    fn master_key_rejects_long_key() {
        let err = MasterKey::new(&[0u8; 32]).expect_err("32-byte key should be rejected");
        assert!(matches!(err, CryptoError::InvalidKeySize(32)));
    }

    #[test]
    fn random_master_keys_differ() {
        let a = MasterKey::random();
        let b = MasterKey::random();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn debug_output_is_masked() {
        let key = MasterKey::new(&[0xAB; 16]).expect("valid key");
        assert_eq!(format!("{key:?}"), "MasterKey(***)");
        let fk = FileKey::from([0xCD; 16]);
        assert_eq!(format!("{fk:?}"), "FileKey(***)");
    }
}
