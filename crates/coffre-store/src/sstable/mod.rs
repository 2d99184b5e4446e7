//! Sorted-string tables with per-block authenticated encryption.
//!
//! Every block — data, index, properties, metaindex — is framed the same
//! way. The plaintext payload (compressed or not) is followed by a 21-byte
//! trailer: a compression-type byte, a CRC32 over `payload ‖ type`, and the
//! 16-byte GCM tag produced by sealing `payload ‖ type ‖ crc` with the nonce
//! derived from the block's file offset. The tag replaces what would
//! otherwise be trailer padding, so the on-disk block is exactly
//! `payload + 21` bytes and carries no per-block nonce.
//!
//! The footer is fixed-size, sealed with its own nonce construction, and
//! decrypted before any parsing happens; an adversary cannot flip the
//! compression type, the checksum, or a handle without failing
//! authentication.

use coffre_crypto_core::{block_nonce, SealKey, TAG_LEN};

use crate::error::{Error, Result};
use crate::options::Compression;
use crate::varint::{put_uvarint, uvarint};
use crate::vfs::File;

pub mod block;
pub mod reader;
pub mod writer;

/// Compression-type byte + CRC32 + GCM tag.
pub const BLOCK_TRAILER_LEN: usize = 1 + 4 + TAG_LEN;

/// Plaintext footer width.
pub const FOOTER_LEN: usize = 53;

/// On-disk (sealed) footer width.
pub const ENCRYPTED_FOOTER_LEN: usize = FOOTER_LEN + TAG_LEN;

const BLOCK_TYPE_NONE: u8 = 0;
const BLOCK_TYPE_SNAPPY: u8 = 1;
const BLOCK_TYPE_ZSTD: u8 = 2;

const CHECKSUM_CRC32: u8 = 0;

const TABLE_MAGIC: [u8; 8] = *b"COFFTBL1";

/// Metaindex key under which the properties block is registered.
pub(crate) const PROPERTIES_METAINDEX_KEY: &[u8] = b"coffre.properties";

// ---------------------------------------------------------------------------
// BlockHandle
// ---------------------------------------------------------------------------

/// Position of a block: file offset and *plaintext payload* length. The
/// on-disk extent is `length + BLOCK_TRAILER_LEN`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    /// File offset of the block's first byte.
    pub offset: u64,
    /// Payload length, excluding the trailer.
    pub length: u64,
}

impl BlockHandle {
    /// Append the varint encoding.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.offset);
        put_uvarint(buf, self.length);
    }

    /// Decode from the front of `buf`, returning the bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a truncated encoding.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, used_offset) = uvarint(buf)?;
        let (length, used_length) = uvarint(&buf[used_offset..])?;
        Ok((Self { offset, length }, used_offset + used_length))
    }
}

// ---------------------------------------------------------------------------
// Block sealing
// ---------------------------------------------------------------------------

/// Compress (if profitable) and seal one block for writing at `offset`.
///
/// Returns the on-disk bytes and the handle's payload length.
pub(crate) fn seal_block(
    seal: &SealKey,
    offset: u64,
    plaintext: &[u8],
    compression: Compression,
) -> Result<(Vec<u8>, u64)> {
    let (block_type, payload): (u8, Vec<u8>) = match compression {
        Compression::None => (BLOCK_TYPE_NONE, plaintext.to_vec()),
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(plaintext)
                .map_err(|e| Error::Cipher(format!("snappy compression failed: {e}")))?;
            if compressed.len() < plaintext.len() {
                (BLOCK_TYPE_SNAPPY, compressed)
            } else {
                (BLOCK_TYPE_NONE, plaintext.to_vec())
            }
        }
        Compression::Zstd => {
            return Err(Error::invalid_argument("zstd compression is not supported"))
        }
    };

    let mut buf = payload;
    let length = buf.len() as u64;
    buf.push(block_type);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    seal.seal_in_place(block_nonce(offset), &mut buf)?;
    Ok((buf, length))
}

/// Open and decompress the block at `handle`.
///
/// `file_num` is threaded through for error context; authentication
/// failures surface as corruption mentioning both the backing file and the
/// checksum taxonomy.
pub(crate) fn read_block(
    file: &dyn File,
    seal: &SealKey,
    file_num: u64,
    handle: BlockHandle,
) -> Result<Vec<u8>> {
    let disk_len = handle.length as usize + BLOCK_TRAILER_LEN;
    let mut buf = vec![0u8; disk_len];
    file.read_exact_at(&mut buf, handle.offset)?;

    let plain = seal
        .open_in_place(block_nonce(handle.offset), &mut buf)
        .map_err(|e| backing_file_error(file_num, &e))?;

    // plain = payload ‖ type ‖ crc32
    let payload_len = plain.len() - 5;
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&plain[payload_len + 1..]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&plain[..payload_len + 1]);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(Error::corruption(format!(
            "backing file {file_num:06} error: checksum mismatch: block crc"
        )));
    }

    let block_type = plain[payload_len];
    let payload = &plain[..payload_len];
    match block_type {
        BLOCK_TYPE_NONE => Ok(payload.to_vec()),
        BLOCK_TYPE_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| Error::corruption(format!("snappy block is malformed: {e}"))),
        BLOCK_TYPE_ZSTD => Err(Error::corruption("zstd blocks are not supported")),
        other => Err(Error::corruption(format!(
            "unknown block compression: {other}"
        ))),
    }
}

/// Corruption error for an authentication failure in a backing file.
pub(crate) fn backing_file_error(file_num: u64, cause: &dyn std::fmt::Display) -> Error {
    Error::corruption(format!(
        "backing file {file_num:06} error: checksum mismatch: {cause}"
    ))
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

/// The fixed-size table footer.
///
/// ```text
/// checksum type (1) ‖ metaindex + index handles (varint, padded to 40) ‖
/// LE32(format version) ‖ magic (8)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    /// Handle of the metaindex block.
    pub metaindex: BlockHandle,
    /// Handle of the index block.
    pub index: BlockHandle,
    /// Format generation recorded at write time.
    pub format_version: u32,
}

impl Footer {
    /// Encode to the plaintext footer layout.
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut handles = Vec::with_capacity(40);
        self.metaindex.encode_to(&mut handles);
        self.index.encode_to(&mut handles);
        handles.resize(40, 0);

        let mut out = [0u8; FOOTER_LEN];
        out[0] = CHECKSUM_CRC32;
        out[1..41].copy_from_slice(&handles);
        out[41..45].copy_from_slice(&self.format_version.to_le_bytes());
        out[45..].copy_from_slice(&TABLE_MAGIC);
        out
    }

    /// Decode a plaintext footer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on a bad magic, checksum type, or
    /// handle encoding.
    pub fn decode(raw: &[u8; FOOTER_LEN]) -> Result<Self> {
        if raw[45..] != TABLE_MAGIC {
            return Err(Error::corruption("invalid table (bad magic number)"));
        }
        if raw[0] != CHECKSUM_CRC32 {
            return Err(Error::corruption(format!(
                "unsupported checksum type: {}",
                raw[0]
            )));
        }
        let (metaindex, used) = BlockHandle::decode_from(&raw[1..41])?;
        let (index, _) = BlockHandle::decode_from(&raw[1 + used..41])?;
        let mut version = [0u8; 4];
        version.copy_from_slice(&raw[41..45]);
        Ok(Self {
            metaindex,
            index,
            format_version: u32::from_le_bytes(version),
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coffre_crypto_core::FileKey;

    use super::*;
    use crate::vfs::{Fs, MemFs};

    fn test_seal() -> SealKey {
        SealKey::new(&FileKey::from([0x42; 16])).expect("cipher construction")
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            metaindex: BlockHandle { offset: 1234, length: 56 },
            index: BlockHandle { offset: 7890, length: 1234 },
            format_version: 1,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_LEN);
        let decoded = Footer::decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            metaindex: BlockHandle::default(),
            index: BlockHandle::default(),
            format_version: 1,
        };
        let mut encoded = footer.encode();
        encoded[50] ^= 1;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn sealed_block_size_is_payload_plus_trailer() {
        let seal = test_seal();
        let plaintext = vec![7u8; 100];
        let (disk, length) = seal_block(&seal, 0, &plaintext, Compression::None)
            .expect("seal should succeed");
        assert_eq!(length, 100);
        assert_eq!(disk.len(), 100 + BLOCK_TRAILER_LEN);
    }

    #[test]
    fn block_roundtrip_with_both_compressions() {
        for compression in [Compression::None, Compression::Snappy] {
            let mem = MemFs::new();
            let fs: Arc<dyn Fs> = Arc::new(mem.clone());
            let seal = test_seal();
            // Compressible payload.
            let plaintext: Vec<u8> = std::iter::repeat_with(|| b"abcdef".iter().copied())
                .take(100)
                .flatten()
                .collect();

            let (disk, length) =
                seal_block(&seal, 0, &plaintext, compression).expect("seal should succeed");
            let mut file = fs.create("t").expect("create");
            file.write_approved(&disk).expect("write");

            let reader = fs.open("t").expect("open");
            let handle = BlockHandle { offset: 0, length };
            let loaded = read_block(reader.as_ref(), &seal, 9, handle).expect("read_block");
            assert_eq!(loaded, plaintext);
        }
    }

    #[test]
    fn zstd_is_rejected_at_seal_time() {
        let seal = test_seal();
        let err = seal_block(&seal, 0, b"x", Compression::Zstd).expect_err("zstd rejected");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn flipped_block_byte_fails_with_parity_message() {
        let mem = MemFs::new();
        let fs: Arc<dyn Fs> = Arc::new(mem.clone());
        let seal = test_seal();
        let (disk, length) =
            seal_block(&seal, 0, b"sensitive payload", Compression::None).expect("seal");
        let mut file = fs.create("t").expect("create");
        file.write_approved(&disk).expect("write");

        let mut raw = mem.read_file("t").expect("read_file");
        raw[4] ^= 1;
        mem.put_file("t", raw).expect("put_file");

        let reader = fs.open("t").expect("open");
        let err = read_block(reader.as_ref(), &seal, 10, BlockHandle { offset: 0, length })
            .expect_err("tampered block");
        let msg = format!("{err}");
        assert!(msg.contains("backing file 000010 error"));
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("cipher: message authentication failed"));
    }

    #[test]
    fn wrong_offset_nonce_fails_authentication() {
        let mem = MemFs::new();
        let fs: Arc<dyn Fs> = Arc::new(mem.clone());
        let seal = test_seal();
        let (disk, length) = seal_block(&seal, 4096, b"payload", Compression::None).expect("seal");
        let mut file = fs.create("t").expect("create");
        file.write_approved(&disk).expect("write");

        // Reading the same bytes as if they sat at offset 0 must fail: the
        // nonce is bound to the block's position.
        let reader = fs.open("t").expect("open");
        assert!(read_block(reader.as_ref(), &seal, 1, BlockHandle { offset: 0, length }).is_err());
    }
}
