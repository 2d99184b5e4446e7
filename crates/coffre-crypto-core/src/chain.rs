//! Salt-chain records: fixed-width blocks linked by HMACs.
//!
//! The key manager persists one [`SaltBlock`] per encrypted file in an
//! append-only chain. Each block's MAC covers the block *and* the previous
//! block's MAC:
//!
//! ```text
//! MAC_i = HMAC-SHA256(MK, LE64(FN_i) ‖ Salt_i ‖ MAC_{i-1})        MAC_0 covers no predecessor
//! ```
//!
//! The chain, not the individual MACs, is the guarantee. Truncating the file
//! removes the salts the live files need; swapping in a block from a forked
//! chain breaks the link because the predecessor MAC differs; replacing a
//! file wholesale fails because a reused file number gets a fresh salt and
//! therefore a fresh key.
//!
//! # Record layout
//!
//! ```text
//! FN (LE u64, 8 B) ‖ Salt (16 B) ‖ MAC (32 B)   = 56 bytes, no header, no trailer
//! ```

use rand::rngs::OsRng;
use rand::RngCore;
use ring::hmac;

use crate::error::CryptoError;
use crate::secret::MasterKey;

/// Width of the file-number field.
pub const FILE_NUM_LEN: usize = 8;

/// Width of the per-file salt.
pub const SALT_LEN: usize = 16;

/// Width of the chaining MAC (HMAC-SHA256).
pub const MAC_LEN: usize = 32;

/// Total width of one salt-chain record.
pub const SALT_BLOCK_LEN: usize = FILE_NUM_LEN + SALT_LEN + MAC_LEN;

// ---------------------------------------------------------------------------
// SaltBlock
// ---------------------------------------------------------------------------

/// One record of the salt chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaltBlock {
    /// File number this salt belongs to.
    pub file_num: u64,
    /// Random per-file salt, never reused across files.
    pub salt: [u8; SALT_LEN],
    /// `HMAC(MK, FN ‖ salt ‖ previous MAC)`.
    pub mac: [u8; MAC_LEN],
}

impl SaltBlock {
    /// Draw a fresh random salt for `file_num` and link it to the chain tail.
    #[must_use]
    pub fn generate(master: &MasterKey, file_num: u64, prev_mac: Option<&[u8; MAC_LEN]>) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mac = compute_mac(master, file_num, &salt, prev_mac);
        Self { file_num, salt, mac }
    }

    /// Encode to the fixed 56-byte record layout.
    #[must_use]
    pub fn encode(&self) -> [u8; SALT_BLOCK_LEN] {
        let mut raw = [0u8; SALT_BLOCK_LEN];
        raw[..FILE_NUM_LEN].copy_from_slice(&self.file_num.to_le_bytes());
        raw[FILE_NUM_LEN..FILE_NUM_LEN + SALT_LEN].copy_from_slice(&self.salt);
        raw[FILE_NUM_LEN + SALT_LEN..].copy_from_slice(&self.mac);
        raw
    }

    /// Decode from a raw record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSaltBlock`] unless `raw` is exactly
    /// 56 bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() != SALT_BLOCK_LEN {
            return Err(CryptoError::InvalidSaltBlock(raw.len()));
        }
        let mut file_num = [0u8; FILE_NUM_LEN];
        file_num.copy_from_slice(&raw[..FILE_NUM_LEN]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[FILE_NUM_LEN..FILE_NUM_LEN + SALT_LEN]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&raw[FILE_NUM_LEN + SALT_LEN..]);
        Ok(Self {
            file_num: u64::from_le_bytes(file_num),
            salt,
            mac,
        })
    }

    /// Verify this block's MAC against the chain tail (constant time).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMac`] if the link does not verify.
    pub fn verify(&self, master: &MasterKey, prev_mac: Option<&[u8; MAC_LEN]>) -> Result<(), CryptoError> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, master.expose());
        hmac::verify(&key, &mac_input(self.file_num, &self.salt, prev_mac), &self.mac)
            .map_err(|_| CryptoError::InvalidMac)
    }
}

/// Compute the chaining MAC for a block.
#[must_use]
pub fn compute_mac(
    master: &MasterKey,
    file_num: u64,
    salt: &[u8; SALT_LEN],
    prev_mac: Option<&[u8; MAC_LEN]>,
) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, master.expose());
    let tag = hmac::sign(&key, &mac_input(file_num, salt, prev_mac));
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(tag.as_ref());
    mac
}

fn mac_input(file_num: u64, salt: &[u8; SALT_LEN], prev_mac: Option<&[u8; MAC_LEN]>) -> Vec<u8> {
    let mut data = Vec::with_capacity(FILE_NUM_LEN + SALT_LEN + MAC_LEN);
    data.extend_from_slice(&file_num.to_le_bytes());
    data.extend_from_slice(salt);
    if let Some(prev) = prev_mac {
        data.extend_from_slice(prev);
    }
    data
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master() -> MasterKey {
        MasterKey::new(&[0x02; 16]).expect("valid key")
    }

    #[test]
    fn encode_decode_roundtrip() {
        let block = SaltBlock::generate(&test_master(), 7, None);
        let raw = block.encode();
        assert_eq!(raw.len(), SALT_BLOCK_LEN);
        let decoded = SaltBlock::decode(&raw).expect("decode should succeed");
        assert_eq!(block, decoded);
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert!(matches!(
            SaltBlock::decode(&[0u8; 55]),
            Err(CryptoError::InvalidSaltBlock(55))
        ));
        assert!(matches!(
            SaltBlock::decode(&[0u8; 57]),
            Err(CryptoError::InvalidSaltBlock(57))
        ));
    }

    #[test]
    fn chain_of_three_verifies() {
        let master = test_master();
        let b0 = SaltBlock::generate(&master, 1, None);
        let b1 = SaltBlock::generate(&master, 2, Some(&b0.mac));
        let b2 = SaltBlock::generate(&master, 3, Some(&b1.mac));

        b0.verify(&master, None).expect("block 0 should verify");
        b1.verify(&master, Some(&b0.mac)).expect("block 1 should verify");
        b2.verify(&master, Some(&b1.mac)).expect("block 2 should verify");
    }

    #[test]
    fn verify_fails_against_wrong_predecessor() {
        let master = test_master();
        let b0 = SaltBlock::generate(&master, 1, None);
        let b1 = SaltBlock::generate(&master, 2, Some(&b0.mac));

        let err = b1
            .verify(&master, None)
            .expect_err("unlinked verification should fail");
        assert!(matches!(err, CryptoError::InvalidMac));
        assert_eq!(format!("{err}"), "invalid mac");
    }

    #[test]
    fn verify_fails_with_wrong_master() {
        let master = test_master();
        let other = MasterKey::new(&[0x03; 16]).expect("valid key");
        let block = SaltBlock::generate(&master, 1, None);
        assert!(block.verify(&other, None).is_err());
    }

    #[test]
    fn verify_fails_on_tampered_salt() {
        let master = test_master();
        let mut block = SaltBlock::generate(&master, 1, None);
        block.salt[0] ^= 1;
        assert!(block.verify(&master, None).is_err());
    }

    #[test]
    fn generated_salts_are_unique() {
        let master = test_master();
        let a = SaltBlock::generate(&master, 1, None);
        let b = SaltBlock::generate(&master, 1, Some(&a.mac));
        assert_ne!(a.salt, b.salt);
    }
}

#[cfg(test)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Any single-byte corruption of an encoded block must break
        /// verification: the MAC covers the file number and the salt, and
        /// damage to the MAC itself fails the comparison.
        #[test]
        fn corrupting_any_byte_is_detected(pos in 0usize..SALT_BLOCK_LEN, xor in 1u8..=255) {
            let master = MasterKey::new(&[0x02; 16]).expect("valid key");
            let block = SaltBlock::generate(&master, 42, None);
            let mut raw = block.encode();
            raw[pos] ^= xor;
            let corrupted = SaltBlock::decode(&raw).expect("width unchanged");
            prop_assert!(corrupted.verify(&master, None).is_err());
        }
    }
}
