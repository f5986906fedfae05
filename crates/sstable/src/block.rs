//! Blocks: the unit of I/O and checksumming.
//!
//! ```text
//! contents: [varint key_len | key | varint val_len | val] * n  | n (u32 LE)
//! trailer:  block type (u8, 0 = raw) | crc32 over contents + type (u32 LE)
//! ```
//!
//! Keys and values are opaque here; the writer decides what they hold.

use anyhow::Result;
use base::encoding::{put_uvarint, Decoder};
use base::corruption;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::format::{BlockHandle, ChecksumType};
use crate::objstorage::Readable;

/// Size of the type byte plus checksum that follows every block.
pub const BLOCK_TRAILER_LEN: usize = 5;

const BLOCK_TYPE_RAW: u8 = 0;

#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        put_uvarint(&mut self.buf, key.len() as u64);
        self.buf.extend_from_slice(key);
        put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes the block will occupy once finished, trailer excluded.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + 4
    }

    /// Returns the block contents and resets the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        let mut n = [0u8; 4];
        LittleEndian::write_u32(&mut n, self.count);
        out.extend_from_slice(&n);
        self.count = 0;
        out
    }
}

fn checksum(contents: &[u8], block_type: u8) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(contents);
    hasher.update(&[block_type]);
    hasher.finalize()
}

/// Appends the 5-byte trailer to finished block contents.
pub fn seal(mut contents: Vec<u8>) -> Vec<u8> {
    let crc = checksum(&contents, BLOCK_TYPE_RAW);
    contents.push(BLOCK_TYPE_RAW);
    let mut c = [0u8; 4];
    LittleEndian::write_u32(&mut c, crc);
    contents.extend_from_slice(&c);
    contents
}

/// Reads the block at `handle` and verifies its trailer.
pub fn read_block(
    r: &dyn Readable,
    handle: BlockHandle,
    checksum_type: ChecksumType,
) -> Result<Block> {
    Block::decode(read_raw_block(r, handle, checksum_type)?)
}

/// Verified contents of a block that is not made of entries.
pub fn read_raw_block(
    r: &dyn Readable,
    handle: BlockHandle,
    checksum_type: ChecksumType,
) -> Result<Vec<u8>> {
    let mut raw = r.read_at(handle.offset, handle.length as usize + BLOCK_TRAILER_LEN)?;
    let len = verify_trailer(&raw, handle.offset, checksum_type)?.len();
    raw.truncate(len);
    Ok(raw)
}

/// Checks the trailer of a sealed block read at `offset` and returns the
/// contents.
pub fn verify_trailer(raw: &[u8], offset: u64, checksum_type: ChecksumType) -> Result<&[u8]> {
    if raw.len() < BLOCK_TRAILER_LEN {
        return Err(corruption(format!("block at offset {} too short", offset)));
    }
    let (contents, trailer) = raw.split_at(raw.len() - BLOCK_TRAILER_LEN);
    let block_type = trailer[0];
    if block_type != BLOCK_TYPE_RAW {
        return Err(corruption(format!("unknown block type {}", block_type)));
    }
    let stored = LittleEndian::read_u32(&trailer[1..]);
    if checksum_type == ChecksumType::Crc32 && stored != checksum(contents, block_type) {
        return Err(corruption(format!(
            "block checksum mismatch at offset {}",
            offset
        )));
    }
    Ok(contents)
}

/// A decoded block with random access to its entries.
#[derive(Debug, Clone)]
pub struct Block {
    data: Vec<u8>,
    /// `(key_start, key_len, val_start, val_len)` per entry.
    entries: Vec<(usize, usize, usize, usize)>,
}

impl Block {
    pub fn decode(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(corruption("block too short"));
        }
        let body_len = data.len() - 4;
        let count = LittleEndian::read_u32(&data[body_len..]) as usize;
        let mut entries = Vec::with_capacity(count.min(body_len));
        {
            let mut d = Decoder::new(&data[..body_len]);
            while !d.is_empty() {
                let key_len = d.uvarint()? as usize;
                let key_start = d.position();
                d.bytes(key_len)?;
                let val_len = d.uvarint()? as usize;
                let val_start = d.position();
                d.bytes(val_len)?;
                entries.push((key_start, key_len, val_start, val_len));
            }
        }
        if entries.len() != count {
            return Err(corruption(format!(
                "block holds {} entries, trailer says {}",
                entries.len(),
                count
            )));
        }
        Ok(Block { data, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self, i: usize) -> &[u8] {
        let (ks, kl, _, _) = self.entries[i];
        &self.data[ks..ks + kl]
    }

    pub fn value(&self, i: usize) -> &[u8] {
        let (_, _, vs, vl) = self.entries[i];
        &self.data[vs..vs + vl]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.len()).map(move |i| (self.key(i), self.value(i)))
    }
}
