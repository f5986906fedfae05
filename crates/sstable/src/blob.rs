//! Blob files: append-only stores for values separated out of tables.
//!
//! ```text
//! [value block 0][trailer] ... [value block N-1][trailer]
//! [index block][trailer]      one (offset, length) handle per value block
//! [footer: index offset (u64 LE) | value count (u64 LE) | magic (8 bytes)]
//! ```
//!
//! Value blocks are plain concatenations of values, cut once they reach
//! the configured block size. A value is addressed by a [`BlobHandle`]:
//! block number, offset inside the block, and length.

use std::sync::Arc;

use anyhow::Result;
use base::{corruption, BlobHandle};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::block::{read_block, seal, verify_trailer, BlockBuilder, BLOCK_TRAILER_LEN};
use crate::format::{BlockHandle, ChecksumType};
use crate::objstorage::{Readable, Writable};

pub const BLOB_MAGIC: &[u8; 8] = b"SHOALblb";
pub const BLOB_FOOTER_LEN: usize = 24;

/// Totals reported when a blob file is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobFileStats {
    pub value_count: u64,
    pub uncompressed_value_bytes: u64,
    pub file_len: u64,
}

pub struct BlobFileWriter {
    out: Box<dyn Writable>,
    block_size: usize,
    block: Vec<u8>,
    handles: Vec<BlockHandle>,
    offset: u64,
    stats: BlobFileStats,
}

impl BlobFileWriter {
    pub fn new(out: Box<dyn Writable>, block_size: usize) -> Self {
        Self {
            out,
            block_size: block_size.max(1),
            block: Vec::new(),
            handles: Vec::new(),
            offset: 0,
            stats: BlobFileStats::default(),
        }
    }

    /// Appends `value` and returns where it will be found.
    pub fn add(&mut self, value: &[u8]) -> Result<BlobHandle> {
        let handle = BlobHandle {
            block_num: self.handles.len() as u32,
            offset_in_block: self.block.len() as u32,
            value_len: value.len() as u32,
        };
        self.block.extend_from_slice(value);
        self.stats.value_count += 1;
        self.stats.uncompressed_value_bytes += value.len() as u64;
        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(handle)
    }

    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    pub fn value_count(&self) -> u64 {
        self.stats.value_count
    }

    fn write_raw(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let sealed = seal(contents);
        self.out.write(&sealed)?;
        self.offset += sealed.len() as u64;
        Ok(handle)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let contents = std::mem::take(&mut self.block);
        let handle = self.write_raw(contents)?;
        self.handles.push(handle);
        Ok(())
    }

    fn write_tail(&mut self) -> Result<()> {
        self.flush_block()?;
        let mut index = BlockBuilder::new();
        for (i, h) in self.handles.iter().enumerate() {
            index.add(&(i as u32).to_be_bytes(), &h.encode());
        }
        let index_handle = self.write_raw(index.finish())?;

        let mut footer = [0u8; BLOB_FOOTER_LEN];
        LittleEndian::write_u64(&mut footer[0..8], index_handle.offset);
        LittleEndian::write_u64(&mut footer[8..16], self.stats.value_count);
        footer[16..].copy_from_slice(BLOB_MAGIC);
        self.out.write(&footer)?;
        self.offset += BLOB_FOOTER_LEN as u64;
        Ok(())
    }

    /// Writes the index and footer and publishes the file. Consumes the
    /// writer, so a blob file is closed exactly once.
    pub fn close(mut self) -> Result<BlobFileStats> {
        if let Err(e) = self.write_tail() {
            self.out.abort();
            return Err(e);
        }
        self.out.finish()?;
        let mut stats = self.stats;
        stats.file_len = self.offset;
        Ok(stats)
    }

    pub fn abort(self) {
        self.out.abort();
    }
}

/// An open blob file.
pub struct BlobFileReader {
    readable: Arc<dyn Readable>,
    blocks: Vec<BlockHandle>,
    value_count: u64,
}

impl BlobFileReader {
    /// Opens a blob file, validating its footer and loading the index.
    pub fn open(readable: Arc<dyn Readable>) -> Result<Self> {
        let size = readable.size();
        if size < BLOB_FOOTER_LEN as u64 {
            return Err(corruption(format!("blob file too small: {} bytes", size)));
        }
        let footer = readable.read_at(size - BLOB_FOOTER_LEN as u64, BLOB_FOOTER_LEN)?;
        if &footer[16..] != BLOB_MAGIC {
            return Err(corruption(format!(
                "bad blob file magic: {:02x?}",
                &footer[16..]
            )));
        }
        let index_offset = LittleEndian::read_u64(&footer[0..8]);
        let value_count = LittleEndian::read_u64(&footer[8..16]);
        let index_end = size - BLOB_FOOTER_LEN as u64;
        if index_offset + (BLOCK_TRAILER_LEN as u64) > index_end {
            return Err(corruption(format!("bad blob index offset {}", index_offset)));
        }
        let index_handle = BlockHandle::new(
            index_offset,
            index_end - index_offset - BLOCK_TRAILER_LEN as u64,
        );
        let index = read_block(readable.as_ref(), index_handle, ChecksumType::Crc32)?;
        let mut blocks = Vec::with_capacity(index.len());
        for (_, v) in index.iter() {
            let (h, _) =
                BlockHandle::decode(v).ok_or_else(|| corruption("bad blob block handle"))?;
            if h.offset + h.length > index_offset {
                return Err(corruption("blob block handle past index"));
            }
            blocks.push(h);
        }
        debug!(blocks = blocks.len(), values = value_count, "opened blob file");
        Ok(Self {
            readable,
            blocks,
            value_count,
        })
    }

    pub fn value_count(&self) -> u64 {
        self.value_count
    }

    pub fn size(&self) -> u64 {
        self.readable.size()
    }

    /// Reads the value at `handle`, verifying its block checksum.
    pub fn read(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        if handle.value_len == 0 {
            return Ok(Vec::new());
        }
        let block = *self.blocks.get(handle.block_num as usize).ok_or_else(|| {
            corruption(format!(
                "blob block {} out of range ({} blocks)",
                handle.block_num,
                self.blocks.len()
            ))
        })?;
        let start = handle.offset_in_block as u64;
        let end = start + handle.value_len as u64;
        if end > block.length {
            return Err(corruption(format!(
                "blob value [{}, {}) past end of block {} ({} bytes)",
                start, end, handle.block_num, block.length
            )));
        }
        let raw = self
            .readable
            .read_at(block.offset, block.length as usize + BLOCK_TRAILER_LEN)?;
        let contents = verify_trailer(&raw, block.offset, ChecksumType::Crc32)?;
        Ok(contents[start as usize..end as usize].to_vec())
    }
}
