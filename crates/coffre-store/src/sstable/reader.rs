//! Table reader: decrypt-then-parse.
//!
//! The footer is decrypted first and handed to the parser as plaintext; the
//! index block is loaded eagerly and data blocks are fetched per seek.

use std::collections::BTreeMap;
use std::sync::Arc;

use coffre_crypto_core::{footer_nonce, FileKey, SealKey};

use crate::error::{Error, Result};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::{
    backing_file_error, read_block, BlockHandle, Footer, ENCRYPTED_FOOTER_LEN, FOOTER_LEN,
    PROPERTIES_METAINDEX_KEY,
};
use crate::vfs::File;

/// An open table.
pub struct Reader {
    file: Box<dyn File>,
    seal: SealKey,
    file_num: u64,
    index: Arc<Block>,
    properties: BTreeMap<String, String>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("file_num", &self.file_num)
            .finish_non_exhaustive()
    }
}

impl Reader {
    /// Open a table: decrypt the footer, then load the index and
    /// properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] for an undersized file, a footer or
    /// block that fails authentication, or malformed block contents.
    pub fn open(file: Box<dyn File>, key: &FileKey, file_num: u64) -> Result<Arc<Self>> {
        let seal = SealKey::new(key)?;
        let size = file.size()?;
        if size < ENCRYPTED_FOOTER_LEN as u64 {
            return Err(Error::corruption("invalid table (file size is too small)"));
        }
        let footer_offset = size - ENCRYPTED_FOOTER_LEN as u64;
        let mut sealed = vec![0u8; ENCRYPTED_FOOTER_LEN];
        file.read_exact_at(&mut sealed, footer_offset)?;
        let plain = seal
            .open_in_place(footer_nonce(footer_offset), &mut sealed)
            .map_err(|e| backing_file_error(file_num, &e))?;
        let mut footer_raw = [0u8; FOOTER_LEN];
        footer_raw.copy_from_slice(plain);
        let footer = Footer::decode(&footer_raw)?;

        let index = Block::new(read_block(file.as_ref(), &seal, file_num, footer.index)?)?;
        let properties =
            Self::load_properties(file.as_ref(), &seal, file_num, footer.metaindex)?;

        Ok(Arc::new(Self {
            file,
            seal,
            file_num,
            index,
            properties,
        }))
    }

    fn load_properties(
        file: &dyn File,
        seal: &SealKey,
        file_num: u64,
        metaindex_handle: BlockHandle,
    ) -> Result<BTreeMap<String, String>> {
        let metaindex = Block::new(read_block(file, seal, file_num, metaindex_handle)?)?;
        let mut iter = BlockIter::new(metaindex);
        iter.first()?;
        let mut props_handle = None;
        while iter.valid() {
            if iter.key() == PROPERTIES_METAINDEX_KEY {
                let (handle, _) = BlockHandle::decode_from(iter.value())?;
                props_handle = Some(handle);
            }
            iter.next()?;
        }

        let mut properties = BTreeMap::new();
        if let Some(handle) = props_handle {
            let block = Block::new(read_block(file, seal, file_num, handle)?)?;
            let mut iter = BlockIter::new(block);
            iter.first()?;
            while iter.valid() {
                properties.insert(
                    String::from_utf8_lossy(iter.key()).into_owned(),
                    String::from_utf8_lossy(iter.value()).into_owned(),
                );
                iter.next()?;
            }
        }
        Ok(properties)
    }

    /// Table properties recorded at write time.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// The table's file number.
    #[must_use]
    pub const fn file_num(&self) -> u64 {
        self.file_num
    }

    fn load_data_block(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        Block::new(read_block(
            self.file.as_ref(),
            &self.seal,
            self.file_num,
            handle,
        )?)
    }

    /// An unpositioned iterator over the table.
    #[must_use]
    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            reader: Arc::clone(self),
            index_iter: BlockIter::new(Arc::clone(&self.index)),
            data_iter: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TableIter
// ---------------------------------------------------------------------------

/// Fused index/data cursor over one table.
pub struct TableIter {
    reader: Arc<Reader>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
}

impl TableIter {
    /// Whether the cursor is positioned on an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(BlockIter::valid)
    }

    /// Current encoded internal key. Empty when invalid.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[], BlockIter::key)
    }

    /// Current value. Empty when invalid.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[], BlockIter::value)
    }

    fn load_current_block(&mut self) -> Result<()> {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return Ok(());
        }
        let (handle, _) = BlockHandle::decode_from(self.index_iter.value())?;
        self.data_iter = Some(BlockIter::new(self.reader.load_data_block(handle)?));
        Ok(())
    }

    /// Position on the table's first entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn first(&mut self) -> Result<()> {
        self.index_iter.first()?;
        self.load_current_block()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.first()?;
        }
        Ok(())
    }

    /// Position on the table's last entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn last(&mut self) -> Result<()> {
        self.index_iter.last()?;
        self.load_current_block()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.last()?;
        }
        Ok(())
    }

    /// Position on the first entry ≥ `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        // The index key is the block's largest entry, so the first index
        // entry ≥ target names the only block that can contain it.
        self.index_iter.seek_ge(target)?;
        self.load_current_block()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_ge(target)?;
            if !data.valid() {
                // target fell in the gap past this block's last entry.
                self.index_iter.next()?;
                self.load_current_block()?;
                if let Some(data) = self.data_iter.as_mut() {
                    data.first()?;
                }
            }
        }
        Ok(())
    }

    /// Position on the last entry < `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        self.index_iter.seek_ge(target)?;
        if self.index_iter.valid() {
            self.load_current_block()?;
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_lt(target)?;
                if !data.valid() {
                    self.index_iter.prev()?;
                    self.load_current_block()?;
                    if let Some(data) = self.data_iter.as_mut() {
                        data.last()?;
                    }
                }
            }
        } else {
            // Every block's last key is < target: answer is the table's
            // last entry.
            self.last()?;
        }
        Ok(())
    }

    /// Advance to the next entry, crossing block boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn next(&mut self) -> Result<()> {
        let Some(data) = self.data_iter.as_mut() else {
            return Ok(());
        };
        data.next()?;
        if !data.valid() {
            self.index_iter.next()?;
            self.load_current_block()?;
            if let Some(data) = self.data_iter.as_mut() {
                data.first()?;
            }
        }
        Ok(())
    }

    /// Step back to the previous entry, crossing block boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] on malformed or tampered blocks.
    pub fn prev(&mut self) -> Result<()> {
        let Some(data) = self.data_iter.as_mut() else {
            return Ok(());
        };
        data.prev()?;
        if !data.valid() {
            self.index_iter.prev()?;
            self.load_current_block()?;
            if let Some(data) = self.data_iter.as_mut() {
                data.last()?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
