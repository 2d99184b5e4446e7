//! Monotonic-counter subsystem: rollback detection state.
//!
//! The store mirrors a 64-bit counter in two places: under a reserved key
//! inside the store itself, and in a caller-supplied trusted counter source
//! (for example an enclave-provided monotonic counter). The invariant is
//! that after open the stored counter is never behind the trusted source;
//! a store that *is* behind was rolled back to an earlier snapshot.
//!
//! The commit protocol advances the stored counter first, then the trusted
//! source, then applies the guarded batch. A failure between the steps
//! leaves the store ahead of the source, which the next successful commit
//! repairs; the store is never behind.

use crate::error::{Error, Result};

/// Reserved key holding the stored counter, little-endian u64. Invisible to
/// user reads and iteration.
pub const MONOTONIC_COUNTER_KEY: &[u8] = b"!EDGELESS_MONOTONIC_COUNTER";

/// Encode a counter value for the reserved key.
#[must_use]
pub fn encode_counter(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Decode the reserved key's value.
///
/// # Errors
///
/// Returns [`Error::Corruption`] unless the value is exactly 8 bytes.
pub fn decode_counter(value: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = value
        .try_into()
        .map_err(|_| Error::corruption("monotonic counter value is malformed"))?;
    Ok(u64::from_le_bytes(raw))
}

/// Outcome of comparing the stored counter against the trusted source at
/// open.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Store and source agree.
    InSync,
    /// The source is behind (a prior commit advanced the store but failed
    /// before advancing the source). The next commit re-syncs it.
    SourceLags,
    /// The store is behind the source: the directory was rolled back.
    Rollback,
}

/// Compare the stored counter against the trusted source.
#[must_use]
pub const fn reconcile(store: u64, source: u64) -> Reconciliation {
    if store < source {
        Reconciliation::Rollback
    } else if store > source {
        Reconciliation::SourceLags
    } else {
        Reconciliation::InSync
    }
}
