//! AES-128-GCM sealing with deterministic positional nonces.
//!
//! This module provides:
//! - [`SealKey`] — an AEAD handle bound to one file key
//! - [`block_nonce`] / [`footer_nonce`] / [`chunk_nonce`] / [`zero_nonce`] —
//!   the deterministic nonce constructions used by the storage layers
//!
//! Nonces are derived from a block's position instead of being stored next to
//! the ciphertext, so encryption adds no per-block metadata beyond the 16-byte
//! tag. Uniqueness holds per file key: a table block is addressed by its file
//! offset, the footer carries a marker byte that separates it from any data
//! block at the same offset, and log chunks are numbered by a monotonic
//! counter. File keys are never shared between files.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};

use crate::error::CryptoError;
use crate::secret::FileKey;

/// AES-128-GCM nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-128-GCM authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// SealKey
// ---------------------------------------------------------------------------

/// An AES-128-GCM key handle for one file.
pub struct SealKey {
    key: LessSafeKey,
}

impl SealKey {
    /// Build the AEAD handle for a file key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the cipher cannot be
    /// constructed.
    pub fn new(key: &FileKey) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&aead::AES_128_GCM, key.expose())
            .map_err(|_| CryptoError::Encryption("failed to create AES-128-GCM key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Seal `buf` in place, appending the 16-byte tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if sealing fails.
    pub fn seal_in_place(&self, nonce: [u8; NONCE_LEN], buf: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(nonce);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buf)
            .map_err(|_| CryptoError::Encryption("AES-128-GCM sealing failed".into()))
    }

    /// Open `buf` in place and return the plaintext prefix (tag stripped).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Authentication`] on tag mismatch.
    pub fn open_in_place<'a>(
        &self,
        nonce: [u8; NONCE_LEN],
        buf: &'a mut [u8],
    ) -> Result<&'a mut [u8], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(nonce);
        self.key
            .open_in_place(nonce, Aad::empty(), buf)
            .map_err(|_| CryptoError::Authentication)
    }
}

// ---------------------------------------------------------------------------
// Nonce construction
// ---------------------------------------------------------------------------

/// Nonce for a table block at the given file offset: `LE64(offset) ‖ 0³²`.
#[must_use]
pub fn block_nonce(offset: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&offset.to_le_bytes());
    nonce
}

/// Nonce for a table footer at the given file offset.
///
/// Byte 8 is set so the footer can never collide with a data block that
/// starts at the same offset.
#[must_use]
pub fn footer_nonce(offset: u64) -> [u8; NONCE_LEN] {
    let mut nonce = block_nonce(offset);
    nonce[8] = 1;
    nonce
}

/// Nonce for the `n`-th sealed log chunk: `LE64(n) ‖ 0³²`.
#[must_use]
pub fn chunk_nonce(iv: u64) -> [u8; NONCE_LEN] {
    block_nonce(iv)
}

/// All-zero nonce, for single-blob files whose key is unique to the file.
#[must_use]
pub const fn zero_nonce() -> [u8; NONCE_LEN] {
    [0u8; NONCE_LEN]
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
