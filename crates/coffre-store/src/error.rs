//! Error types for `coffre-store`.
//!
//! All crypto failures are non-retryable. I/O errors on WAL fsync fail the
//! current batch but leave the engine usable for subsequent attempts.

use std::io;

use coffre_crypto_core::CryptoError;
use thiserror::Error;

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested key is absent.
    #[error("coffre: not found")]
    NotFound,

    /// Authenticated decryption failed or a block is malformed. Fatal for
    /// the affected file.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A salt-chain link is broken, the chain is damaged, or a live file has
    /// no salt entry. Fatal at open; the store refuses to mount.
    #[error("invalid mac: {0}")]
    InvalidMac(String),

    /// The store's persisted counter is behind the trusted source: the
    /// directory was rolled back to an earlier state. Fatal at open.
    #[error("rollback detected: store counter: {store}, trusted source counter: {trusted}")]
    RollbackDetected {
        /// Counter read from the store.
        store: u64,
        /// Counter read from the trusted source.
        trusted: u64,
    },

    /// Underlying filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The configured master key has the wrong length.
    #[error("invalid key size: {0} bytes (expected 16)")]
    InvalidKeySize(usize),

    /// The iterator's cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// A cipher operation failed for a reason other than authentication.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// An unsupported option or argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Build a [`Error::Corruption`] from a display-able message.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Build an [`Error::InvalidArgument`] from a display-able message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => Self::Corruption(err.to_string()),
            CryptoError::InvalidMac => Self::InvalidMac("salt chain verification failed".into()),
            CryptoError::InvalidSaltBlock(n) => {
                Self::InvalidMac(format!("invalid salt block size: {n} bytes"))
            }
            CryptoError::InvalidKeySize(n) => Self::InvalidKeySize(n),
            CryptoError::Encryption(msg) | CryptoError::KeyDerivation(msg) => Self::Cipher(msg),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_maps_to_corruption() {
        let err = Error::from(CryptoError::Authentication);
        assert!(matches!(err, Error::Corruption(_)));
        assert!(format!("{err}").contains("cipher: message authentication failed"));
    }

    #[test]
    fn invalid_mac_message_contains_literal() {
        let err = Error::from(CryptoError::InvalidMac);
        assert!(format!("{err}").contains("invalid mac"));
    }

    #[test]
    fn partial_salt_block_maps_to_invalid_mac() {
        let err = Error::from(CryptoError::InvalidSaltBlock(40));
        assert!(matches!(err, Error::InvalidMac(_)));
    }

    #[test]
    fn rollback_message_names_both_counters() {
        let err = Error::RollbackDetected { store: 3, trusted: 5 };
        let msg = format!("{err}");
        assert!(msg.contains("rollback detected"));
        assert!(msg.contains("store counter: 3"));
        assert!(msg.contains("trusted source counter: 5"));
    }
}
