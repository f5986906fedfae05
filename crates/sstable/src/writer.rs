use std::cmp::Ordering;

use anyhow::Result;
use base::encoding::put_uvarint;
use base::{invariant, Comparer, InlineHandle, InternalKey, InternalKeyKind, SeqNum, Span};
use bloom::FilterBuilder;

use crate::block::{seal, BlockBuilder};
use crate::format::{BlockHandle, ChecksumType, Footer, TableFormat};
use crate::objstorage::Writable;
use crate::properties::Properties;

/// Metaindex names of the optional blocks.
pub(crate) const META_FILTER: &str = "shoal.filter.bloom";
pub(crate) const META_RANGE_DEL: &str = "shoal.range_del";
pub(crate) const META_RANGE_KEY: &str = "shoal.range_key";
pub(crate) const META_PROPERTIES: &str = "shoal.properties";

/// Prefix byte of a data block value.
pub(crate) const VALUE_INLINE: u8 = 0;
pub(crate) const VALUE_BLOB_HANDLE: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub comparer: &'static Comparer,
    /// Data blocks are cut once they reach this many bytes.
    pub block_size: usize,
    /// Bits per key prefix of the bloom filter; 0 disables the filter.
    pub bloom_bits_per_key: usize,
}

impl WriterOptions {
    pub fn new(comparer: &'static Comparer, block_size: usize) -> Self {
        Self {
            comparer,
            block_size,
            bloom_bits_per_key: 10,
        }
    }

    pub fn with_bloom_bits(mut self, bits_per_key: usize) -> Self {
        self.bloom_bits_per_key = bits_per_key;
        self
    }
}

/// Summary of a finished table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterMetadata {
    pub size: u64,
    /// Bounds over point keys and range deletions.
    pub smallest_point: Option<InternalKey>,
    pub largest_point: Option<InternalKey>,
    pub smallest_range_key: Option<InternalKey>,
    pub largest_range_key: Option<InternalKey>,
    pub smallest_seq: SeqNum,
    pub largest_seq: SeqNum,
    pub properties: Properties,
}

impl WriterMetadata {
    /// Smallest key of the table over both key spaces.
    pub fn smallest(&self, cmp: &Comparer) -> Option<InternalKey> {
        pick(cmp, &self.smallest_point, &self.smallest_range_key, Ordering::Less)
    }

    /// Largest key of the table over both key spaces.
    pub fn largest(&self, cmp: &Comparer) -> Option<InternalKey> {
        pick(cmp, &self.largest_point, &self.largest_range_key, Ordering::Greater)
    }

    fn observe_seq(&mut self, seq: SeqNum) {
        self.smallest_seq = self.smallest_seq.min(seq);
        self.largest_seq = self.largest_seq.max(seq);
    }
}

fn pick(
    cmp: &Comparer,
    a: &Option<InternalKey>,
    b: &Option<InternalKey>,
    want: Ordering,
) -> Option<InternalKey> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if cmp.cmp_internal(b, a) == want {
            b.clone()
        } else {
            a.clone()
        }),
        (Some(k), None) | (None, Some(k)) => Some(k.clone()),
        (None, None) => None,
    }
}

/// Streams point keys and fragmented spans into a new sorted file.
///
/// Point keys must arrive in strictly increasing internal key order and
/// spans in increasing, non-overlapping order; anything else is an
/// invariant error. The object is only published by [`finish`]; dropping
/// the writer or calling [`abort`] leaves nothing behind.
///
/// [`finish`]: TableWriter::finish
/// [`abort`]: TableWriter::abort
pub struct TableWriter {
    out: Box<dyn Writable>,
    opts: WriterOptions,
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Option<InternalKey>,
    range_dels: BlockBuilder,
    last_range_del_end: Option<Vec<u8>>,
    range_keys: BlockBuilder,
    last_range_key_end: Option<Vec<u8>>,
    span_bytes: usize,
    meta: WriterMetadata,
    value_buf: Vec<u8>,
    filter: Option<FilterBuilder>,
}

impl TableWriter {
    pub fn new(out: Box<dyn Writable>, opts: WriterOptions) -> Self {
        Self {
            out,
            filter: (opts.bloom_bits_per_key > 0)
                .then(|| FilterBuilder::new(opts.bloom_bits_per_key)),
            opts,
            offset: 0,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            last_key: None,
            range_dels: BlockBuilder::new(),
            last_range_del_end: None,
            range_keys: BlockBuilder::new(),
            last_range_key_end: None,
            span_bytes: 0,
            meta: WriterMetadata {
                smallest_seq: SeqNum::MAX,
                ..WriterMetadata::default()
            },
            value_buf: Vec::new(),
        }
    }

    /// Adds a point key with an in-place value.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        self.value_buf.clear();
        self.value_buf.push(VALUE_INLINE);
        self.value_buf.extend_from_slice(value);
        self.meta.properties.raw_value_size += value.len() as u64;
        self.add_point(key)
    }

    /// Adds a point key whose value lives in a blob file.
    pub fn add_with_blob_handle(
        &mut self,
        key: &InternalKey,
        handle: InlineHandle,
        short_attr: u8,
    ) -> Result<()> {
        self.value_buf.clear();
        self.value_buf.push(VALUE_BLOB_HANDLE);
        put_uvarint(&mut self.value_buf, handle.reference_index as u64);
        put_uvarint(&mut self.value_buf, handle.handle.value_len as u64);
        put_uvarint(&mut self.value_buf, handle.handle.block_num as u64);
        put_uvarint(&mut self.value_buf, handle.handle.offset_in_block as u64);
        self.value_buf.push(short_attr);
        self.meta.properties.num_blob_handles += 1;
        self.meta.properties.blob_value_size += handle.handle.value_len as u64;
        self.add_point(key)
    }

    fn add_point(&mut self, key: &InternalKey) -> Result<()> {
        if !key.kind().is_point() {
            return Err(invariant(format!("{} is not a point key", key)));
        }
        if let Some(last) = &self.last_key {
            if self.opts.comparer.cmp_internal(last, key) != Ordering::Less {
                return Err(invariant(format!(
                    "keys added out of order: {} then {}",
                    last, key
                )));
            }
        }

        let props = &mut self.meta.properties;
        props.num_entries += 1;
        props.raw_key_size += key.encoded_len() as u64;
        match key.kind() {
            InternalKeyKind::Delete | InternalKeyKind::SingleDelete => props.num_deletions += 1,
            InternalKeyKind::Merge => props.num_merge_operands += 1,
            _ => {}
        }
        self.meta.observe_seq(key.seq());
        self.widen_smallest_point(key.clone());
        self.widen_largest_point(key.clone());

        if let Some(filter) = &mut self.filter {
            filter.add(self.opts.comparer.prefix(&key.user_key));
        }
        self.data_block.add(&key.encode(), &self.value_buf);
        self.last_key = Some(key.clone());
        if self.data_block.estimated_size() >= self.opts.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn widen_largest_point(&mut self, key: InternalKey) {
        let cmp = self.opts.comparer;
        let wider = match &self.meta.largest_point {
            Some(cur) => cmp.cmp_internal(cur, &key) == Ordering::Less,
            None => true,
        };
        if wider {
            self.meta.largest_point = Some(key);
        }
    }

    fn widen_smallest_point(&mut self, key: InternalKey) {
        let cmp = self.opts.comparer;
        let wider = match &self.meta.smallest_point {
            Some(cur) => cmp.cmp_internal(cur, &key) == Ordering::Greater,
            None => true,
        };
        if wider {
            self.meta.smallest_point = Some(key);
        }
    }

    /// Adds a range deletion fragment. Fragments must be added in order
    /// and must not overlap.
    pub fn add_range_del(&mut self, span: &Span) -> Result<()> {
        if span.keys.is_empty() {
            return Ok(());
        }
        if let Some(k) = span.keys.iter().find(|k| k.kind() != InternalKeyKind::RangeDelete) {
            return Err(invariant(format!("{:?} in a range deletion", k)));
        }
        check_span_order(self.opts.comparer, &self.last_range_del_end, span)?;
        self.last_range_del_end = Some(span.end.clone());

        for k in &span.keys {
            self.meta.observe_seq(k.seq());
        }
        self.meta.properties.num_range_deletions += span.keys.len() as u64;
        self.widen_smallest_point(InternalKey {
            user_key: span.start.clone(),
            trailer: span.keys[0].trailer,
        });
        self.widen_largest_point(InternalKey::exclusive_sentinel(
            span.end.clone(),
            InternalKeyKind::RangeDelete,
        ));

        let value = span.encode_value();
        self.span_bytes += span.start.len() + value.len();
        self.range_dels.add(&span.start, &value);
        Ok(())
    }

    /// Adds a range key fragment. Fragments must be added in order and
    /// must not overlap.
    pub fn add_range_key(&mut self, span: &Span) -> Result<()> {
        if span.keys.is_empty() {
            return Ok(());
        }
        if let Some(k) = span.keys.iter().find(|k| !k.kind().is_range_key()) {
            return Err(invariant(format!("{:?} in a range key span", k)));
        }
        check_span_order(self.opts.comparer, &self.last_range_key_end, span)?;
        self.last_range_key_end = Some(span.end.clone());

        for k in &span.keys {
            self.meta.observe_seq(k.seq());
        }
        self.meta.properties.num_range_keys += span.keys.len() as u64;
        if self.meta.smallest_range_key.is_none() {
            self.meta.smallest_range_key = Some(InternalKey {
                user_key: span.start.clone(),
                trailer: span.keys[0].trailer,
            });
        }
        self.meta.largest_range_key = Some(InternalKey::exclusive_sentinel(
            span.end.clone(),
            InternalKeyKind::RangeKeySet,
        ));

        let value = span.encode_value();
        self.span_bytes += span.start.len() + value.len();
        self.range_keys.add(&span.start, &value);
        Ok(())
    }

    /// Bytes the table would occupy if finished now.
    pub fn estimated_size(&self) -> u64 {
        self.offset
            + self.data_block.estimated_size() as u64
            + self.index_block.estimated_size() as u64
            + self.span_bytes as u64
    }

    /// True until a point key or span has been added.
    pub fn is_empty(&self) -> bool {
        self.last_key.is_none() && self.range_dels.is_empty() && self.range_keys.is_empty()
    }

    pub fn last_point_key(&self) -> Option<&InternalKey> {
        self.last_key.as_ref()
    }

    fn write_block(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let sealed = seal(contents);
        self.out.write(&sealed)?;
        self.offset += sealed.len() as u64;
        Ok(handle)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = self.data_block.finish();
        let handle = self.write_block(contents)?;
        self.meta.properties.num_data_blocks += 1;
        // The separator is the block's last key.
        if let Some(last) = &self.last_key {
            self.index_block.add(&last.encode(), &handle.encode());
        }
        Ok(())
    }

    fn write_tail(&mut self) -> Result<()> {
        self.flush_data_block()?;

        let index_contents = self.index_block.finish();
        let index = self.write_block(index_contents)?;

        let mut meta_blocks = Vec::with_capacity(4);
        if let Some(filter) = self.filter.take().filter(|f| !f.is_empty()) {
            self.meta.properties.num_filter_keys = filter.len() as u64;
            let h = self.write_block(filter.finish())?;
            meta_blocks.push((META_FILTER, h));
        }
        if !self.range_dels.is_empty() {
            let contents = self.range_dels.finish();
            meta_blocks.push((META_RANGE_DEL, self.write_block(contents)?));
        }
        if !self.range_keys.is_empty() {
            let contents = self.range_keys.finish();
            meta_blocks.push((META_RANGE_KEY, self.write_block(contents)?));
        }
        let props_contents = self.meta.properties.encode();
        meta_blocks.push((META_PROPERTIES, self.write_block(props_contents)?));

        meta_blocks.sort_unstable_by_key(|(name, _)| *name);
        let mut metaindex = BlockBuilder::new();
        for (name, h) in &meta_blocks {
            metaindex.add(name.as_bytes(), &h.encode());
        }
        let metaindex = self.write_block(metaindex.finish())?;

        let footer = Footer {
            format: TableFormat::CURRENT,
            checksum: ChecksumType::Crc32,
            metaindex,
            index,
        };
        let buf = footer.encode();
        self.out.write(&buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Writes the index, span, properties and metaindex blocks plus the
    /// footer, then publishes the object.
    ///
    /// # Errors
    ///
    /// On any error the partially written object is discarded.
    pub fn finish(mut self) -> Result<WriterMetadata> {
        if let Err(e) = self.write_tail() {
            self.out.abort();
            return Err(e);
        }
        self.out.finish()?;
        let mut meta = self.meta;
        meta.size = self.offset;
        if meta.smallest_seq == SeqNum::MAX {
            meta.smallest_seq = 0;
        }
        Ok(meta)
    }

    pub fn abort(self) {
        self.out.abort();
    }
}

fn check_span_order(cmp: &Comparer, last_end: &Option<Vec<u8>>, span: &Span) -> Result<()> {
    if cmp.cmp(&span.start, &span.end) != Ordering::Less {
        return Err(invariant(format!("empty span {:?}", span)));
    }
    if let Some(end) = last_end {
        if cmp.cmp(end, &span.start) == Ordering::Greater {
            return Err(invariant(format!(
                "span {:?} overlaps previous span ending at {}",
                span,
                String::from_utf8_lossy(end)
            )));
        }
    }
    Ok(())
}
