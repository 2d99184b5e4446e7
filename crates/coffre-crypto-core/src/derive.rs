//! HKDF-SHA256 file-key derivation.
//!
//! Every persisted file gets its own 128-bit key:
//! `FK = HKDF-SHA256(salt = file salt, ikm = master key, info = ∅)`,
//! truncated to 16 bytes. Salts are never reused across files, so file keys
//! are pairwise independent.

use ring::hkdf;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::secret::{FileKey, MasterKey, KEY_LEN};

/// `ring` expresses HKDF output length through a key type.
struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the per-file key for the given salt.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_file_key(master: &MasterKey, salt: &[u8]) -> Result<FileKey, CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(master.expose());
    let okm = prk
        .expand(&[], OkmLen(KEY_LEN))
        .map_err(|_| CryptoError::KeyDerivation("hkdf expand failed".into()))?;

    let mut out = [0u8; KEY_LEN];
    okm.fill(&mut out)
        .map_err(|_| CryptoError::KeyDerivation("hkdf output fill failed".into()))?;
    let key = FileKey::from(out);
    out.zeroize();
    Ok(key)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
