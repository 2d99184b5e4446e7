//! Version edits, the manifest log, and on-disk file naming.
//!
//! The manifest is an encrypted record log (see [`crate::record`]) of
//! [`VersionEdit`]s. Replaying every edit from the start reconstructs the
//! engine state: the live WAL number, the file-number allocator, the last
//! committed sequence number, and the set of level-0 tables. `CURRENT` is a
//! plaintext pointer to the live manifest; its integrity derives from the
//! manifest it points to, which is encrypted and registered in the salt
//! chain like every other data file.

use bincode::{Decode, Encode};

use crate::base::SEQ_NUM_START;
use crate::error::{Error, Result};

/// Plaintext pointer to the active manifest.
pub const CURRENT_FILENAME: &str = "CURRENT";

/// `nnnnnn.sst`
#[must_use]
pub fn table_filename(file_num: u64) -> String {
    format!("{file_num:06}.sst")
}

/// `nnnnnn.log`
#[must_use]
pub fn wal_filename(file_num: u64) -> String {
    format!("{file_num:06}.log")
}

/// `MANIFEST-nnnnnn`
#[must_use]
pub fn manifest_filename(file_num: u64) -> String {
    format!("MANIFEST-{file_num:06}")
}

/// `OPTIONS-nnnnnn`
#[must_use]
pub fn options_filename(file_num: u64) -> String {
    format!("OPTIONS-{file_num:06}")
}

/// Parse a `MANIFEST-nnnnnn` name back into its file number.
#[must_use]
pub fn parse_manifest_filename(name: &str) -> Option<u64> {
    name.strip_prefix("MANIFEST-")?.parse().ok()
}

// ---------------------------------------------------------------------------
// Version edits
// ---------------------------------------------------------------------------

/// A flushed table registered in the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct TableMeta {
    /// The table's file number.
    pub file_num: u64,
    /// Final file size in bytes.
    pub size: u64,
    /// Number of entries.
    pub num_entries: u64,
    /// Smallest encoded internal key.
    pub smallest: Vec<u8>,
    /// Largest encoded internal key.
    pub largest: Vec<u8>,
}

/// One manifest record. Fields are optional so an edit states only what
/// changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct VersionEdit {
    /// The live WAL's file number.
    pub log_num: Option<u64>,
    /// Next value of the file-number allocator.
    pub next_file_num: Option<u64>,
    /// Last committed sequence number at the time of the edit.
    pub last_seq_num: Option<u64>,
    /// Format generation, recorded once at creation.
    pub format_major_version: Option<u64>,
    /// Tables added by this edit.
    pub new_tables: Vec<TableMeta>,
}

impl VersionEdit {
    /// Encode for appending to the manifest log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Io(std::io::Error::other(format!("manifest edit encoding failed: {e}"))))
    }

    /// Decode one manifest record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if the record is malformed or carries
    /// trailing bytes.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (edit, used) = bincode::decode_from_slice(raw, bincode::config::standard())
            .map_err(|e| Error::corruption(format!("manifest edit is malformed: {e}")))?;
        if used != raw.len() {
            return Err(Error::corruption("manifest edit carries trailing bytes"));
        }
        Ok(edit)
    }
}

// ---------------------------------------------------------------------------
// Replay state
// ---------------------------------------------------------------------------

/// Accumulated result of replaying a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestState {
    /// The live WAL's file number.
    pub log_num: u64,
    /// Next file number to allocate.
    pub next_file_num: u64,
    /// Last committed sequence number.
    pub last_seq_num: u64,
    /// Format generation the store was created with.
    pub format_major_version: u64,
    /// Live tables, oldest first.
    pub tables: Vec<TableMeta>,
}

impl Default for ManifestState {
    fn default() -> Self {
        Self {
            log_num: 0,
            next_file_num: 1,
            last_seq_num: SEQ_NUM_START - 1,
            format_major_version: 0,
            tables: Vec::new(),
        }
    }
}

impl ManifestState {
    /// Fold one edit into the state.
    pub fn apply(&mut self, edit: VersionEdit) {
        if let Some(log_num) = edit.log_num {
            self.log_num = log_num;
        }
        if let Some(next_file_num) = edit.next_file_num {
            self.next_file_num = next_file_num;
        }
        if let Some(last_seq_num) = edit.last_seq_num {
            self.last_seq_num = last_seq_num;
        }
        if let Some(version) = edit.format_major_version {
            self.format_major_version = version;
        }
        self.tables.extend(edit.new_tables);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_zero_padded() {
        assert_eq!(table_filename(10), "000010.sst");
        assert_eq!(wal_filename(2), "000002.log");
        assert_eq!(manifest_filename(1), "MANIFEST-000001");
        assert_eq!(options_filename(3), "OPTIONS-000003");
    }

    #[test]
    fn manifest_filename_parses_back() {
        assert_eq!(parse_manifest_filename("MANIFEST-000042"), Some(42));
        assert_eq!(parse_manifest_filename("MANIFEST-"), None);
        assert_eq!(parse_manifest_filename("000042.sst"), None);
    }

    #[test]
    fn edit_roundtrip() {
        let edit = VersionEdit {
            log_num: Some(5),
            next_file_num: Some(7),
            last_seq_num: Some(123),
            format_major_version: Some(1),
            new_tables: vec![TableMeta {
                file_num: 4,
                size: 4096,
                num_entries: 17,
                smallest: b"a".to_vec(),
                largest: b"z".to_vec(),
            }],
        };
        let raw = edit.encode().expect("encode");
        assert_eq!(VersionEdit::decode(&raw).expect("decode"), edit);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut raw = VersionEdit::default().encode().expect("encode");
        raw.push(0);
        assert!(VersionEdit::decode(&raw).is_err());
    }

    #[test]
    fn state_folds_edits_in_order() {
        let mut state = ManifestState::default();
        assert_eq!(state.next_file_num, 1);
        assert_eq!(state.last_seq_num, SEQ_NUM_START - 1);

        state.apply(VersionEdit {
            log_num: Some(2),
            next_file_num: Some(4),
            format_major_version: Some(1),
            ..VersionEdit::default()
        });
        state.apply(VersionEdit {
            log_num: Some(5),
            next_file_num: Some(6),
            last_seq_num: Some(42),
            new_tables: vec![TableMeta {
                file_num: 4,
                size: 100,
                num_entries: 1,
                smallest: b"k".to_vec(),
                largest: b"k".to_vec(),
            }],
            ..VersionEdit::default()
        });

        assert_eq!(state.log_num, 5);
        assert_eq!(state.next_file_num, 6);
        assert_eq!(state.last_seq_num, 42);
        assert_eq!(state.format_major_version, 1);
        assert_eq!(state.tables.len(), 1);
    }
}
