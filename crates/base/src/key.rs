use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::corruption;

/// Sequence number assigned to every write at commit time.
pub type SeqNum = u64;

/// Largest representable sequence number (56 bits). Reading at this
/// ceiling observes everything committed.
pub const SEQ_NUM_MAX: SeqNum = (1 << 56) - 1;

/// Length of the encoded trailer that follows the user key.
pub const TRAILER_LEN: usize = 8;

/// Kind of an internal key. The discriminants are persisted and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InternalKeyKind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    SingleDelete = 7,
    RangeDelete = 15,
    RangeKeyDelete = 19,
    RangeKeyUnset = 20,
    RangeKeySet = 21,
    /// Only used to build search keys; never persisted.
    Max = 255,
}

impl InternalKeyKind {
    /// Decodes a persisted kind byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Delete,
            1 => Self::Set,
            2 => Self::Merge,
            7 => Self::SingleDelete,
            15 => Self::RangeDelete,
            19 => Self::RangeKeyDelete,
            20 => Self::RangeKeyUnset,
            21 => Self::RangeKeySet,
            255 => Self::Max,
            _ => return None,
        })
    }

    /// True for the kinds stored as individual point entries.
    pub fn is_point(self) -> bool {
        matches!(
            self,
            Self::Delete | Self::Set | Self::Merge | Self::SingleDelete
        )
    }

    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            Self::RangeKeyDelete | Self::RangeKeyUnset | Self::RangeKeySet
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Delete => "DEL",
            Self::Set => "SET",
            Self::Merge => "MERGE",
            Self::SingleDelete => "SINGLEDEL",
            Self::RangeDelete => "RANGEDEL",
            Self::RangeKeyDelete => "RANGEKEYDEL",
            Self::RangeKeyUnset => "RANGEKEYUNSET",
            Self::RangeKeySet => "RANGEKEYSET",
            Self::Max => "MAX",
        }
    }
}

impl fmt::Display for InternalKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packs a sequence number and kind into a trailer.
#[inline]
pub fn make_trailer(seq: SeqNum, kind: InternalKeyKind) -> u64 {
    debug_assert!(seq <= SEQ_NUM_MAX);
    (seq << 8) | kind as u64
}

#[inline]
pub fn trailer_seq(trailer: u64) -> SeqNum {
    trailer >> 8
}

/// Kind stored in a trailer. Unknown kind bytes map to
/// [`InternalKeyKind::Max`]; decoders validate kinds before building keys.
#[inline]
pub fn trailer_kind(trailer: u64) -> InternalKeyKind {
    InternalKeyKind::from_u8((trailer & 0xff) as u8).unwrap_or(InternalKeyKind::Max)
}

/// A user key plus its `(seq, kind)` trailer.
///
/// Ordering depends on the database comparer, so `InternalKey` does not
/// implement `Ord`; use [`Comparer::cmp_internal`](crate::Comparer::cmp_internal).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: SeqNum, kind: InternalKeyKind) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: make_trailer(seq, kind),
        }
    }

    /// The key that sorts before every version of `user_key`.
    pub fn search(user_key: impl Into<Vec<u8>>) -> Self {
        Self::new(user_key, SEQ_NUM_MAX, InternalKeyKind::Max)
    }

    /// An exclusive upper bound at `user_key`: it sorts before every real
    /// key with the same user key. Used as the largest bound of files whose
    /// last entry is a span ending at `user_key`.
    pub fn exclusive_sentinel(user_key: impl Into<Vec<u8>>, kind: InternalKeyKind) -> Self {
        Self::new(user_key, SEQ_NUM_MAX, kind)
    }

    pub fn is_exclusive_sentinel(&self) -> bool {
        self.seq() == SEQ_NUM_MAX
            && matches!(
                self.kind(),
                InternalKeyKind::RangeDelete | InternalKeyKind::RangeKeySet
            )
    }

    #[inline]
    pub fn seq(&self) -> SeqNum {
        trailer_seq(self.trailer)
    }

    #[inline]
    pub fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }

    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_LEN
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.trailer.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes `user_key ++ trailer`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the buffer is shorter than a trailer
    /// or the kind byte is unknown.
    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < TRAILER_LEN {
            return Err(corruption(format!(
                "internal key too short: {} bytes",
                buf.len()
            )));
        }
        let split = buf.len() - TRAILER_LEN;
        let trailer = LittleEndian::read_u64(&buf[split..]);
        if InternalKeyKind::from_u8((trailer & 0xff) as u8).is_none() {
            return Err(corruption(format!(
                "unknown internal key kind {}",
                trailer & 0xff
            )));
        }
        Ok(Self {
            user_key: buf[..split].to_vec(),
            trailer,
        })
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq() == SEQ_NUM_MAX {
            write!(
                f,
                "{}#inf,{}",
                String::from_utf8_lossy(&self.user_key),
                self.kind()
            )
        } else {
            write!(
                f,
                "{}#{},{}",
                String::from_utf8_lossy(&self.user_key),
                self.seq(),
                self.kind()
            )
        }
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
