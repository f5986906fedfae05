//! Varint and length-prefixed encodings used by blocks, handles, version
//! edits and span values.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::corruption;

/// Maximum encoded length of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decodes a varint, returning the value and the number of bytes consumed.
pub fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if shift == 63 && b > 1 {
            return None;
        }
        v |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Some((v, i + 1));
        }
        shift += 7;
    }
    None
}

pub fn put_length_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Cursor over an encoded buffer. Every short read is a corruption error.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn uvarint(&mut self) -> anyhow::Result<u64> {
        let (v, n) = uvarint(self.remaining())
            .ok_or_else(|| corruption(format!("bad varint at offset {}", self.pos)))?;
        self.pos += n;
        Ok(v)
    }

    pub fn u8(&mut self) -> anyhow::Result<u8> {
        let b = *self
            .remaining()
            .first()
            .ok_or_else(|| corruption("unexpected end of buffer"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u64_le(&mut self) -> anyhow::Result<u64> {
        let bytes = self.bytes(8)?;
        Ok(LittleEndian::read_u64(bytes))
    }

    pub fn bytes(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                corruption(format!(
                    "need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn length_prefixed(&mut self) -> anyhow::Result<&'a [u8]> {
        let n = self.uvarint()?;
        self.bytes(n as usize)
    }
}
