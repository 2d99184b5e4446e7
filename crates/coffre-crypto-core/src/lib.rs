//! `coffre-crypto-core` — Pure cryptographic primitives for COFFRE.
//!
//! This crate is the audit target: zero I/O, zero async. It provides the
//! building blocks of the store's trusted persistence layer:
//!
//! - [`aead`] — AES-128-GCM sealing with deterministic positional nonces
//! - [`derive`] — HKDF-SHA256 per-file key derivation
//! - [`chain`] — salt-chain records linked by HMAC-SHA256
//! - [`secret`] — zeroizing master/file key wrappers

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod aead;
pub mod chain;
pub mod derive;
pub mod error;
pub mod secret;

pub use aead::{block_nonce, chunk_nonce, footer_nonce, zero_nonce, SealKey, NONCE_LEN, TAG_LEN};
pub use chain::{compute_mac, SaltBlock, MAC_LEN, SALT_BLOCK_LEN, SALT_LEN};
pub use derive::derive_file_key;
pub use error::CryptoError;
pub use secret::{FileKey, MasterKey, KEY_LEN};
