//! Cryptographic error types for `coffre-crypto-core`.

use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication tag verification failed — ciphertext tampered, wrong
    /// key, or wrong nonce. The message keeps diagnostic parity with the
    /// store's corruption taxonomy.
    #[error("cipher: message authentication failed")]
    Authentication,

    /// Sealing failed (cipher construction or nonce handling).
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A salt-chain MAC link does not verify.
    #[error("invalid mac")]
    InvalidMac,

    /// Master key material has the wrong length.
    #[error("invalid key size: {0} bytes (expected 16)")]
    InvalidKeySize(usize),

    /// HKDF key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A salt-chain record has the wrong width.
    #[error("invalid salt block size: {0} bytes (expected 56)")]
    InvalidSaltBlock(usize),
}
