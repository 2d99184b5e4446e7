//! Internal key model.
//!
//! User keys are wrapped into *internal keys*: the user key followed by an
//! 8-byte trailer packing a 56-bit sequence number and an 8-bit kind,
//! `trailer = (seq << 8) | kind`, little-endian on disk. Internal keys sort
//! by user key ascending, then by trailer *descending*, so the newest version
//! of a user key is encountered first.
//!
//! The kind numbering is part of the file format and must not change.

use std::cmp::Ordering;
use std::fmt;

/// The zero sequence number, reserved for keys known to have nothing below.
pub const SEQ_NUM_ZERO: u64 = 0;

/// The first sequence number assigned to a key. 1–9 are reserved.
pub const SEQ_NUM_START: u64 = 10;

/// Bit 55, set on batch-local sequence numbers so in-progress batch entries
/// stay visible to the batch's own iterators without being published.
pub const SEQ_NUM_BATCH_BIT: u64 = 1 << 55;

/// The largest valid sequence number (56 bits).
pub const SEQ_NUM_MAX: u64 = (1 << 56) - 1;

/// Width of the internal key trailer.
pub const TRAILER_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The kind of an internal key: tombstone, set value, merge operand, etc.
///
/// These discriminants are part of the file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InternalKeyKind {
    /// Point deletion tombstone.
    Delete = 0,
    /// Plain value.
    Set = 1,
    /// Merge operand.
    Merge = 2,
    /// WAL-only payload, never indexed.
    LogData = 3,
    /// Single-shot deletion tombstone.
    SingleDelete = 7,
    /// Range deletion tombstone.
    RangeDelete = 15,
    /// Separator key written to block indexes.
    Separator = 17,
    /// A SET that already met a deletion in a prior rewrite.
    SetWithDelete = 18,
    /// Removes range keys within a span.
    RangeKeyDelete = 19,
    /// Unsets a range key.
    RangeKeyUnset = 20,
    /// Sets a range key.
    RangeKeySet = 21,
    /// Marks a WAL entry for an ingested table.
    IngestSst = 22,
    /// Deletion tombstone carrying the expected size of the shadowed entry.
    DeleteSized = 23,
    /// Marker for an invalid key.
    Invalid = 191,
}

/// The largest kind value that can appear in a file.
pub const KIND_MAX: InternalKeyKind = InternalKeyKind::DeleteSized;

/// Trailer of a range-delete sentinel: the exclusive upper boundary used when
/// a range tombstone is the largest key in a table.
pub const RANGE_DELETE_SENTINEL: u64 = (SEQ_NUM_MAX << 8) | InternalKeyKind::RangeDelete as u64;

/// Trailer marking a range-key boundary during interleaved iteration.
pub const BOUNDARY_RANGE_KEY: u64 = (SEQ_NUM_MAX << 8) | InternalKeyKind::RangeKeySet as u64;

impl InternalKeyKind {
    /// Decode a kind byte. Unknown values map to [`InternalKeyKind::Invalid`].
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Delete,
            1 => Self::Set,
            2 => Self::Merge,
            3 => Self::LogData,
            7 => Self::SingleDelete,
            15 => Self::RangeDelete,
            17 => Self::Separator,
            18 => Self::SetWithDelete,
            19 => Self::RangeKeyDelete,
            20 => Self::RangeKeyUnset,
            21 => Self::RangeKeySet,
            22 => Self::IngestSst,
            23 => Self::DeleteSized,
            _ => Self::Invalid,
        }
    }

    /// True for the kinds that delete a point key.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::Delete | Self::SingleDelete | Self::DeleteSized)
    }
}

impl fmt::Display for InternalKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Delete => "DEL",
            Self::Set => "SET",
            Self::Merge => "MERGE",
            Self::LogData => "LOGDATA",
            Self::SingleDelete => "SINGLEDEL",
            Self::RangeDelete => "RANGEDEL",
            Self::Separator => "SEPARATOR",
            Self::SetWithDelete => "SETWITHDEL",
            Self::RangeKeyDelete => "RANGEKEYDEL",
            Self::RangeKeyUnset => "RANGEKEYUNSET",
            Self::RangeKeySet => "RANGEKEYSET",
            Self::IngestSst => "INGESTSST",
            Self::DeleteSized => "DELSIZED",
            Self::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Trailer packing
// ---------------------------------------------------------------------------

/// Pack a sequence number and kind into a trailer.
#[must_use]
pub const fn make_trailer(seq_num: u64, kind: InternalKeyKind) -> u64 {
    (seq_num << 8) | kind as u64
}

/// Extract the sequence number from a trailer.
#[must_use]
pub const fn trailer_seq_num(trailer: u64) -> u64 {
    trailer >> 8
}

/// Extract the kind from a trailer.
#[must_use]
pub const fn trailer_kind(trailer: u64) -> InternalKeyKind {
    InternalKeyKind::from_u8((trailer & 0xff) as u8)
}

// ---------------------------------------------------------------------------
// InternalKey
// ---------------------------------------------------------------------------

/// An owned internal key: user key plus trailer.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// The application-visible key.
    pub user_key: Vec<u8>,
    /// `(seq << 8) | kind`.
    pub trailer: u64,
}

impl InternalKey {
    /// Construct from parts.
    #[must_use]
    pub fn new(user_key: impl Into<Vec<u8>>, seq_num: u64, kind: InternalKeyKind) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: make_trailer(seq_num, kind),
        }
    }

    /// A key that sorts before every other internal key with the same user
    /// key; used when seeking for any version of a user key.
    #[must_use]
    pub fn search_key(user_key: impl Into<Vec<u8>>) -> Self {
        Self::new(user_key, SEQ_NUM_MAX, KIND_MAX)
    }

    /// The key's sequence number.
    #[must_use]
    pub const fn seq_num(&self) -> u64 {
        trailer_seq_num(self.trailer)
    }

    /// The key's kind.
    #[must_use]
    pub const fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }

    /// Encode as `user_key ‖ LE64(trailer)`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + TRAILER_LEN);
        out.extend_from_slice(&self.user_key);
        out.extend_from_slice(&self.trailer.to_le_bytes());
        out
    }

    /// Decode from `user_key ‖ LE64(trailer)`. Returns `None` if the buffer
    /// is too short to carry a trailer.
    #[must_use]
    pub fn decode(encoded: &[u8]) -> Option<Self> {
        let (user_key, trailer) = split_encoded(encoded)?;
        Some(Self {
            user_key: user_key.to_vec(),
            trailer,
        })
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{},{}",
            String::from_utf8_lossy(&self.user_key),
            self.seq_num(),
            self.kind()
        )
    }
}

/// Split an encoded internal key into its user key and trailer.
#[must_use]
pub fn split_encoded(encoded: &[u8]) -> Option<(&[u8], u64)> {
    if encoded.len() < TRAILER_LEN {
        return None;
    }
    let split = encoded.len() - TRAILER_LEN;
    let mut trailer = [0u8; TRAILER_LEN];
    trailer.copy_from_slice(&encoded[split..]);
    Some((&encoded[..split], u64::from_le_bytes(trailer)))
}

/// User-key portion of an encoded internal key.
#[must_use]
pub fn user_key_of(encoded: &[u8]) -> &[u8] {
    split_encoded(encoded).map_or(encoded, |(user, _)| user)
}

/// Trailer of an encoded internal key (0 if the buffer is too short).
#[must_use]
pub fn trailer_of(encoded: &[u8]) -> u64 {
    split_encoded(encoded).map_or(0, |(_, trailer)| trailer)
}

/// Compare two encoded internal keys: user key ascending, trailer descending
/// (newer first, larger kind first).
#[must_use]
pub fn cmp_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let (a_user, a_trailer) = split_encoded(a).unwrap_or((a, 0));
    let (b_user, b_trailer) = split_encoded(b).unwrap_or((b, 0));
    a_user
        .cmp(b_user)
        .then_with(|| b_trailer.cmp(&a_trailer))
}

/// An encoded internal key ordered by [`cmp_encoded`], for use as an ordered
/// map key.
#[derive(Clone, PartialEq, Eq)]
pub struct OrderedKey(pub Vec<u8>);

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_encoded(&self.0, &other.0)
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for OrderedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match InternalKey::decode(&self.0) {
            Some(key) => write!(f, "{key:?}"),
            None => write!(f, "OrderedKey({:02x?})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_packs_seq_and_kind() {
        let trailer = make_trailer(42, InternalKeyKind::Set);
        assert_eq!(trailer_seq_num(trailer), 42);
        assert_eq!(trailer_kind(trailer), InternalKeyKind::Set);
    }

    #[test]
    fn kind_numbering_is_stable() {
        assert_eq!(InternalKeyKind::Delete as u8, 0);
        assert_eq!(InternalKeyKind::Set as u8, 1);
        assert_eq!(InternalKeyKind::Merge as u8, 2);
        assert_eq!(InternalKeyKind::LogData as u8, 3);
        assert_eq!(InternalKeyKind::SingleDelete as u8, 7);
        assert_eq!(InternalKeyKind::RangeDelete as u8, 15);
        assert_eq!(InternalKeyKind::Separator as u8, 17);
        assert_eq!(InternalKeyKind::SetWithDelete as u8, 18);
        assert_eq!(InternalKeyKind::RangeKeyDelete as u8, 19);
        assert_eq!(InternalKeyKind::RangeKeyUnset as u8, 20);
        assert_eq!(InternalKeyKind::RangeKeySet as u8, 21);
        assert_eq!(InternalKeyKind::IngestSst as u8, 22);
        assert_eq!(InternalKeyKind::DeleteSized as u8, 23);
    }

    #[test]
    fn sentinels_match_kind_numbering() {
        assert_eq!(RANGE_DELETE_SENTINEL, (SEQ_NUM_MAX << 8) | 15);
        assert_eq!(BOUNDARY_RANGE_KEY, (SEQ_NUM_MAX << 8) | 21);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = InternalKey::new(b"roses".as_slice(), 11, InternalKeyKind::Set);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 5 + TRAILER_LEN);
        let decoded = InternalKey::decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, key);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(InternalKey::decode(&[1, 2, 3]).is_none());
    }

    #[test]
    fn ordering_is_user_key_ascending() {
        let a = InternalKey::new(b"a".as_slice(), 5, InternalKeyKind::Set).encode();
        let b = InternalKey::new(b"b".as_slice(), 5, InternalKeyKind::Set).encode();
        assert_eq!(cmp_encoded(&a, &b), Ordering::Less);
    }

    #[test]
    fn ordering_is_trailer_descending_for_equal_user_keys() {
        let newer = InternalKey::new(b"k".as_slice(), 12, InternalKeyKind::Set).encode();
        let older = InternalKey::new(b"k".as_slice(), 11, InternalKeyKind::Set).encode();
        assert_eq!(cmp_encoded(&newer, &older), Ordering::Less);
    }

    #[test]
    fn search_key_sorts_before_all_versions() {
        let search = InternalKey::search_key(b"k".as_slice()).encode();
        let newest = InternalKey::new(b"k".as_slice(), SEQ_NUM_MAX, InternalKeyKind::Set).encode();
        assert_eq!(cmp_encoded(&search, &newest), Ordering::Less);
    }

    #[test]
    fn batch_bit_is_inside_the_seq_space() {
        assert!(SEQ_NUM_BATCH_BIT < SEQ_NUM_MAX);
        assert_eq!(SEQ_NUM_BATCH_BIT, 1 << 55);
    }

    #[test]
    fn unknown_kind_decodes_to_invalid() {
        assert_eq!(InternalKeyKind::from_u8(99), InternalKeyKind::Invalid);
    }
}
