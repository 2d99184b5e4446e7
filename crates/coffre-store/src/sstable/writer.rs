//! Table writer: sorted entries in, sealed blocks out.

use coffre_crypto_core::{footer_nonce, FileKey, SealKey};

use crate::base::cmp_encoded;
use crate::error::{Error, Result};
use crate::options::Compression;
use crate::sstable::block::{BlockBuilder, DATA_RESTART_INTERVAL, INDEX_RESTART_INTERVAL};
use crate::sstable::{seal_block, BlockHandle, Footer, BLOCK_TRAILER_LEN, PROPERTIES_METAINDEX_KEY};
use crate::vfs::File;

/// Summary of a finished table, registered in the manifest by the caller.
#[derive(Clone, Debug)]
pub struct WrittenTable {
    /// Smallest encoded internal key.
    pub smallest: Vec<u8>,
    /// Largest encoded internal key.
    pub largest: Vec<u8>,
    /// Number of entries.
    pub num_entries: u64,
    /// Final file size in bytes.
    pub size: u64,
}

/// Writes one table. Entries must be added in ascending internal-key order;
/// [`Writer::finish`] seals the index, properties, metaindex, and footer and
/// fsyncs before returning.
pub struct Writer {
    file: Box<dyn File>,
    seal: SealKey,
    offset: u64,
    compression: Compression,
    block_size: usize,
    format_version: u32,
    data_block: BlockBuilder,
    /// `(last key of block, handle)` for each finished data block.
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    smallest: Option<Vec<u8>>,
    last_key: Vec<u8>,
    num_entries: u64,
}

impl Writer {
    /// Start writing a table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for zstd compression and
    /// [`Error::Cipher`] if the cipher cannot be constructed.
    pub fn new(
        file: Box<dyn File>,
        key: &FileKey,
        block_size: usize,
        compression: Compression,
        format_version: u32,
    ) -> Result<Self> {
        if compression == Compression::Zstd {
            return Err(Error::invalid_argument("zstd compression is not supported"));
        }
        Ok(Self {
            file,
            seal: SealKey::new(key)?,
            offset: 0,
            compression,
            block_size: block_size.max(64),
            format_version,
            data_block: BlockBuilder::new(DATA_RESTART_INTERVAL),
            index_entries: Vec::new(),
            smallest: None,
            last_key: Vec::new(),
            num_entries: 0,
        })
    }

    /// Append one entry (encoded internal key + value).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if keys arrive out of order and
    /// [`Error::Io`] if a finished block cannot be written.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.num_entries > 0 && cmp_encoded(key, &self.last_key) != std::cmp::Ordering::Greater {
            return Err(Error::invalid_argument(
                "table entries must be added in ascending order",
            ));
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        self.data_block.add(key, value);
        self.num_entries += 1;
        if self.data_block.estimated_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let last_key = self.data_block.last_key().to_vec();
        let plaintext = self.data_block.finish();
        let handle = self.write_block(&plaintext, self.compression)?;
        self.index_entries.push((last_key, handle));
        Ok(())
    }

    fn write_block(&mut self, plaintext: &[u8], compression: Compression) -> Result<BlockHandle> {
        let (disk, length) = seal_block(&self.seal, self.offset, plaintext, compression)?;
        self.file.write_approved(&disk)?;
        let handle = BlockHandle {
            offset: self.offset,
            length,
        };
        self.offset += length + BLOCK_TRAILER_LEN as u64;
        Ok(handle)
    }

    /// Seal the remaining blocks and the footer, fsync, and return the
    /// table summary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty table and
    /// [`Error::Io`] on write or fsync failure.
    pub fn finish(mut self) -> Result<WrittenTable> {
        let smallest = self
            .smallest
            .take()
            .ok_or_else(|| Error::invalid_argument("cannot finish an empty table"))?;
        let largest = self.last_key.clone();
        self.flush_data_block()?;

        // Properties block: a handful of self-describing key/values, linear
        // scanned on read.
        let mut props = BlockBuilder::new(INDEX_RESTART_INTERVAL);
        props.add(
            b"coffre.num-entries",
            self.num_entries.to_string().as_bytes(),
        );
        props.add(
            b"coffre.num-data-blocks",
            self.index_entries.len().to_string().as_bytes(),
        );
        let props_plain = props.finish();
        let props_handle = self.write_block(&props_plain, self.compression)?;

        // Metaindex: names the properties block.
        let mut metaindex = BlockBuilder::new(INDEX_RESTART_INTERVAL);
        let mut props_handle_enc = Vec::new();
        props_handle.encode_to(&mut props_handle_enc);
        metaindex.add(PROPERTIES_METAINDEX_KEY, &props_handle_enc);
        let metaindex_plain = metaindex.finish();
        let metaindex_handle = self.write_block(&metaindex_plain, self.compression)?;

        // Index block: last key of each data block → handle. Index blocks
        // are never compressed so a handle lookup costs one block read.
        let mut index = BlockBuilder::new(INDEX_RESTART_INTERVAL);
        for (last_key, handle) in &self.index_entries {
            let mut value = Vec::new();
            handle.encode_to(&mut value);
            index.add(last_key, &value);
        }
        let index_plain = index.finish();
        let index_handle = self.write_block(&index_plain, Compression::None)?;

        // Footer, sealed under its own nonce at the footer offset.
        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
            format_version: self.format_version,
        };
        let mut sealed_footer = footer.encode().to_vec();
        self.seal
            .seal_in_place(footer_nonce(self.offset), &mut sealed_footer)?;
        self.file.write_approved(&sealed_footer)?;
        self.offset += sealed_footer.len() as u64;

        self.file.sync()?;
        Ok(WrittenTable {
            smallest,
            largest,
            num_entries: self.num_entries,
            size: self.offset,
        })
    }
}
