use anyhow::Result;

use crate::key::InternalKey;

/// Locates a value inside a blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobHandle {
    pub block_num: u32,
    pub offset_in_block: u32,
    pub value_len: u32,
}

/// The form a blob handle takes inside a sorted file: the blob file is
/// named by an index into the file's blob reference list rather than by
/// file number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineHandle {
    pub reference_index: u32,
    pub handle: BlobHandle,
}

/// A separated value after its reference index has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobValue {
    pub file_num: u64,
    pub handle: BlobHandle,
    pub short_attr: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalValue {
    Inline(Vec<u8>),
    Blob(BlobValue),
}

impl InternalValue {
    /// Length of the user value, fetched or not.
    pub fn len(&self) -> usize {
        match self {
            InternalValue::Inline(v) => v.len(),
            InternalValue::Blob(b) => b.handle.value_len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, InternalValue::Blob(_))
    }

    /// The value bytes, reading separated values through `fetcher`.
    pub fn fetch(&self, fetcher: &dyn ValueFetcher) -> Result<Vec<u8>> {
        match self {
            InternalValue::Inline(v) => Ok(v.clone()),
            InternalValue::Blob(b) => fetcher.fetch(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKv {
    pub key: InternalKey,
    pub value: InternalValue,
}

impl InternalKv {
    pub fn new(key: InternalKey, value: InternalValue) -> Self {
        Self { key, value }
    }

    pub fn inline(key: InternalKey, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: InternalValue::Inline(value.into()),
        }
    }
}

/// Reads values that were separated into blob files.
pub trait ValueFetcher: Send + Sync {
    fn fetch(&self, value: &BlobValue) -> Result<Vec<u8>>;
}

/// Bidirectional cursor over internal point keys in comparer order.
///
/// Seeks take user keys: `seek_ge` lands on the newest version of the
/// first user key `>= key`, `seek_lt` on the oldest version of the last
/// user key `< key`. After a positioning call, [`current`] is `None` when
/// the cursor ran off either end. Stepping an exhausted cursor is not
/// defined; reposition it with a seek, `first` or `last`.
///
/// [`current`]: InternalIterator::current
pub trait InternalIterator: Send {
    fn first(&mut self) -> Result<()>;
    fn last(&mut self) -> Result<()>;
    fn seek_ge(&mut self, key: &[u8]) -> Result<()>;
    fn seek_lt(&mut self, key: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn prev(&mut self) -> Result<()>;
    fn current(&self) -> Option<&InternalKv>;
}

impl<I: InternalIterator + ?Sized> InternalIterator for Box<I> {
    fn first(&mut self) -> Result<()> {
        (**self).first()
    }
    fn last(&mut self) -> Result<()> {
        (**self).last()
    }
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        (**self).seek_ge(key)
    }
    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        (**self).seek_lt(key)
    }
    fn next(&mut self) -> Result<()> {
        (**self).next()
    }
    fn prev(&mut self) -> Result<()> {
        (**self).prev()
    }
    fn current(&self) -> Option<&InternalKv> {
        (**self).current()
    }
}
