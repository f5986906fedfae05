use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use base::encoding::Decoder;
use bloom::BloomFilter;
use base::{
    corruption, BlobHandle, BlobValue, Comparer, InternalIterator, InternalKey, InternalKv,
    InternalValue, Span,
};
use tracing::debug;

use crate::block::{read_block, read_raw_block, Block};
use crate::format::{read_footer, BlockHandle, Footer, TableFormat};
use crate::objstorage::Readable;
use crate::properties::Properties;
use crate::writer::{
    META_FILTER, META_PROPERTIES, META_RANGE_DEL, META_RANGE_KEY, VALUE_BLOB_HANDLE, VALUE_INLINE,
};

/// An open sorted file.
///
/// On [`open`](TableReader::open) the footer, index, properties and both
/// span blocks are loaded into memory; data blocks are read on demand by
/// [`TableIter`] and verified against their checksum on every read.
pub struct TableReader {
    readable: Arc<dyn Readable>,
    cmp: &'static Comparer,
    footer: Footer,
    /// Last key of each data block and the block's handle.
    index: Vec<(InternalKey, BlockHandle)>,
    properties: Properties,
    range_dels: Vec<Span>,
    range_keys: Vec<Span>,
    filter: Option<BloomFilter>,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("format", &self.footer.format)
            .field("data_blocks", &self.index.len())
            .field("range_dels", &self.range_dels.len())
            .field("range_keys", &self.range_keys.len())
            .field("filter", &self.filter)
            .finish()
    }
}

impl TableReader {
    /// Opens a table and loads its metadata blocks.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the footer is invalid, the format is
    /// not a native one, any metadata block fails its checksum, or the
    /// index is not sorted.
    pub fn open(readable: Arc<dyn Readable>, cmp: &'static Comparer) -> Result<Self> {
        let footer = read_footer(readable.as_ref())?;
        if !matches!(footer.format, TableFormat::Shoal(_)) {
            return Err(corruption(format!(
                "cannot read {} tables, only the native format",
                footer.format
            )));
        }
        let checksum = footer.checksum;

        let index_block = read_block(readable.as_ref(), footer.index, checksum)
            .context("reading index block")?;
        let mut index = Vec::with_capacity(index_block.len());
        for (k, v) in index_block.iter() {
            let key = InternalKey::decode(k)?;
            let (handle, _) =
                BlockHandle::decode(v).ok_or_else(|| corruption("bad data block handle"))?;
            if let Some((prev, _)) = index.last() {
                if cmp.cmp_internal(prev, &key) != Ordering::Less {
                    return Err(corruption(format!("index out of order at {}", key)));
                }
            }
            index.push((key, handle));
        }

        let metaindex = read_block(readable.as_ref(), footer.metaindex, checksum)
            .context("reading metaindex block")?;
        let mut properties = Properties::default();
        let mut range_dels = Vec::new();
        let mut range_keys = Vec::new();
        let mut filter = None;
        for (name, v) in metaindex.iter() {
            let (handle, _) =
                BlockHandle::decode(v).ok_or_else(|| corruption("bad meta block handle"))?;
            let name = std::str::from_utf8(name).unwrap_or("");
            if name == META_FILTER {
                let raw = read_raw_block(readable.as_ref(), handle, checksum)?;
                filter = Some(
                    BloomFilter::decode(&raw)
                        .map_err(|e| corruption(format!("bad filter block: {}", e)))?,
                );
                continue;
            }
            let block = read_block(readable.as_ref(), handle, checksum)?;
            match name {
                META_PROPERTIES => properties = Properties::decode(&block)?,
                META_RANGE_DEL => range_dels = decode_spans(&block)?,
                META_RANGE_KEY => {
                    if !footer.format.supports_value_blocks() {
                        return Err(corruption(format!(
                            "range keys in a {} table",
                            footer.format
                        )));
                    }
                    range_keys = decode_spans(&block)?
                }
                _ => {}
            }
        }

        debug!(
            format = %footer.format,
            data_blocks = index.len(),
            entries = properties.num_entries,
            "opened table"
        );
        Ok(Self {
            readable,
            cmp,
            footer,
            index,
            properties,
            range_dels,
            range_keys,
            filter,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// False if the table certainly holds no point key with this prefix.
    /// Tables written without a filter always answer true.
    pub fn may_contain_prefix(&self, prefix: &[u8]) -> bool {
        self.filter.as_ref().map_or(true, |f| f.may_contain(prefix))
    }

    /// Fragmented range deletions, sorted by start key.
    pub fn range_dels(&self) -> &[Span] {
        &self.range_dels
    }

    /// Fragmented range keys, sorted by start key.
    pub fn range_keys(&self) -> &[Span] {
        &self.range_keys
    }

    pub fn size(&self) -> u64 {
        self.readable.size()
    }

    fn read_data_block(&self, i: usize) -> Result<Block> {
        read_block(self.readable.as_ref(), self.index[i].1, self.footer.checksum)
    }

    /// A cursor over the point keys.
    pub fn iter(self: &Arc<Self>, opts: TableIterOptions) -> TableIter {
        TableIter {
            table: Arc::clone(self),
            blob_refs: opts.blob_refs,
            lower: opts.lower,
            upper: opts.upper,
            block_idx: 0,
            block: None,
            entry_idx: 0,
            cur: None,
        }
    }
}

fn decode_spans(block: &Block) -> Result<Vec<Span>> {
    block.iter().map(|(k, v)| Span::decode(k, v)).collect()
}

/// Options for [`TableReader::iter`].
#[derive(Debug, Clone, Default)]
pub struct TableIterOptions {
    /// File numbers of the blob files referenced by the table, indexed by
    /// reference index.
    pub blob_refs: Arc<[u64]>,
    /// Inclusive bounds of a virtual table.
    pub lower: Option<InternalKey>,
    pub upper: Option<InternalKey>,
}

/// Bidirectional cursor over one table's point keys.
pub struct TableIter {
    table: Arc<TableReader>,
    blob_refs: Arc<[u64]>,
    lower: Option<InternalKey>,
    upper: Option<InternalKey>,
    block_idx: usize,
    block: Option<Block>,
    entry_idx: usize,
    cur: Option<InternalKv>,
}

impl TableIter {
    fn cmp(&self) -> &'static Comparer {
        self.table.cmp
    }

    fn load(&mut self, bi: usize) -> Result<()> {
        if self.block.is_none() || self.block_idx != bi {
            self.block = Some(self.table.read_data_block(bi)?);
            self.block_idx = bi;
        }
        Ok(())
    }

    fn block_len(&self) -> usize {
        self.block.as_ref().map_or(0, Block::len)
    }

    /// Positions on the first entry at or after `(bi, ei)`.
    fn settle_forward(&mut self, mut bi: usize, mut ei: usize) -> Result<()> {
        let n = self.table.index.len();
        if bi >= n {
            self.cur = None;
            return Ok(());
        }
        self.load(bi)?;
        while ei >= self.block_len() {
            bi += 1;
            if bi >= n {
                self.cur = None;
                return Ok(());
            }
            self.load(bi)?;
            ei = 0;
        }
        self.entry_idx = ei;
        self.decode_current()?;
        let past_upper = match (&self.cur, &self.upper) {
            (Some(cur), Some(upper)) => {
                self.table.cmp.cmp_internal(&cur.key, upper) == Ordering::Greater
            }
            _ => false,
        };
        if past_upper {
            self.cur = None;
        }
        Ok(())
    }

    /// Positions on the last entry before `(bi, ei)`.
    fn settle_backward(&mut self, mut bi: usize, mut ei: usize) -> Result<()> {
        loop {
            if ei > 0 {
                break;
            }
            if bi == 0 {
                self.cur = None;
                return Ok(());
            }
            bi -= 1;
            self.load(bi)?;
            ei = self.block_len();
        }
        self.load(bi)?;
        self.entry_idx = ei - 1;
        self.decode_current()?;
        let before_lower = match (&self.cur, &self.lower) {
            (Some(cur), Some(lower)) => {
                self.table.cmp.cmp_internal(&cur.key, lower) == Ordering::Less
            }
            _ => false,
        };
        if before_lower {
            self.cur = None;
        }
        Ok(())
    }

    /// Block and entry of the first key `>= target` (or `> target` when
    /// `inclusive` is false).
    fn locate(&mut self, target: &InternalKey, inclusive: bool) -> Result<(usize, usize)> {
        let cmp = self.cmp();
        let before = |k: &InternalKey| match cmp.cmp_internal(k, target) {
            Ordering::Less => true,
            Ordering::Equal => !inclusive,
            Ordering::Greater => false,
        };
        let bi = self.table.index.partition_point(|(sep, _)| before(sep));
        if bi >= self.table.index.len() {
            return Ok((bi, 0));
        }
        self.load(bi)?;
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| corruption("data block not loaded"))?;
        let mut lo = 0;
        let mut hi = block.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if before(&InternalKey::decode(block.key(mid))?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok((bi, lo))
    }

    fn seek_internal_ge(&mut self, target: &InternalKey) -> Result<()> {
        let target = match &self.lower {
            Some(lower) if self.cmp().cmp_internal(target, lower) == Ordering::Less => {
                lower.clone()
            }
            _ => target.clone(),
        };
        let (bi, ei) = self.locate(&target, true)?;
        self.settle_forward(bi, ei)
    }

    /// Positions on the last key `< target`, or `<= target` if `inclusive`.
    fn seek_internal_lt(&mut self, target: &InternalKey, inclusive: bool) -> Result<()> {
        let (target, inclusive) = match &self.upper {
            Some(upper) if self.cmp().cmp_internal(target, upper) == Ordering::Greater => {
                (upper.clone(), true)
            }
            _ => (target.clone(), inclusive),
        };
        let (bi, ei) = self.locate(&target, !inclusive)?;
        if bi >= self.table.index.len() {
            let n = self.table.index.len();
            if n == 0 {
                self.cur = None;
                return Ok(());
            }
            self.load(n - 1)?;
            let len = self.block_len();
            return self.settle_backward(n - 1, len);
        }
        self.settle_backward(bi, ei)
    }

    fn decode_current(&mut self) -> Result<()> {
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| corruption("data block not loaded"))?;
        let key = InternalKey::decode(block.key(self.entry_idx))?;
        let raw = block.value(self.entry_idx);
        let value = match raw.first() {
            Some(&VALUE_INLINE) => InternalValue::Inline(raw[1..].to_vec()),
            Some(&VALUE_BLOB_HANDLE) => {
                let mut d = Decoder::new(&raw[1..]);
                let reference_index = d.uvarint()? as usize;
                let value_len = d.uvarint()? as u32;
                let block_num = d.uvarint()? as u32;
                let offset_in_block = d.uvarint()? as u32;
                let short_attr = d.u8()?;
                let file_num = *self.blob_refs.get(reference_index).ok_or_else(|| {
                    corruption(format!(
                        "blob reference index {} out of range ({} references)",
                        reference_index,
                        self.blob_refs.len()
                    ))
                })?;
                InternalValue::Blob(BlobValue {
                    file_num,
                    handle: BlobHandle {
                        block_num,
                        offset_in_block,
                        value_len,
                    },
                    short_attr,
                })
            }
            other => {
                return Err(corruption(format!(
                    "unknown value prefix {:?} for {}",
                    other, key
                )))
            }
        };
        self.cur = Some(InternalKv::new(key, value));
        Ok(())
    }
}

impl InternalIterator for TableIter {
    fn first(&mut self) -> Result<()> {
        match self.lower.clone() {
            Some(lower) => self.seek_internal_ge(&lower),
            None => self.settle_forward(0, 0),
        }
    }

    fn last(&mut self) -> Result<()> {
        match self.upper.clone() {
            Some(upper) => self.seek_internal_lt(&upper, true),
            None => {
                let n = self.table.index.len();
                if n == 0 {
                    self.cur = None;
                    return Ok(());
                }
                self.load(n - 1)?;
                let len = self.block_len();
                self.settle_backward(n - 1, len)
            }
        }
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        self.seek_internal_ge(&InternalKey::search(key.to_vec()))
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        self.seek_internal_lt(&InternalKey::search(key.to_vec()), false)
    }

    fn next(&mut self) -> Result<()> {
        if self.cur.is_none() {
            return Ok(());
        }
        self.settle_forward(self.block_idx, self.entry_idx + 1)
    }

    fn prev(&mut self) -> Result<()> {
        if self.cur.is_none() {
            return Ok(());
        }
        self.settle_backward(self.block_idx, self.entry_idx)
    }

    fn current(&self) -> Option<&InternalKv> {
        self.cur.as_ref()
    }
}
