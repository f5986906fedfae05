//! Sorted file footer and block handles.
//!
//! Three magic numbers are recognised, each selecting a footer layout:
//!
//! ## LevelDB footer (48 bytes)
//!
//! ```text
//! [metaindex handle | index handle | zero padding to 40 bytes][magic: 8 bytes]
//! ```
//!
//! No checksum type byte and no version; blocks use CRC32.
//!
//! ## RocksDB and Shoal footers (53 bytes)
//!
//! ```text
//! [checksum type: u8][metaindex handle | index handle | zero padding to 40 bytes]
//! [format version: u32 LE][magic: 8 bytes]
//! ```
//!
//! Shoal version 1 holds point keys only; version 2 adds blob handles and
//! range keys. The writer always produces Shoal version 2.
//!
//! The reader reads the last [`MAX_FOOTER_LEN`] bytes (or the whole file
//! when shorter), detects the magic from the final 8 bytes, then decodes
//! the layout for that magic.

use std::fmt;

use anyhow::Result;
use base::corruption;
use base::encoding::{put_uvarint, uvarint};
use byteorder::{ByteOrder, LittleEndian};

use crate::objstorage::Readable;

pub const LEVELDB_MAGIC: &[u8; 8] = b"\x57\xfb\x80\x8b\x24\x75\x47\xdb";
pub const ROCKSDB_MAGIC: &[u8; 8] = b"\xf7\xcf\xf4\x85\xb7\x41\xe2\x88";
pub const SHOAL_MAGIC: &[u8; 8] = b"SHOALsst";

const MAGIC_LEN: usize = 8;
/// Two block handles, each at most two 10-byte varints.
const HANDLES_LEN: usize = 2 * (10 + 10);

pub const LEVELDB_FOOTER_LEN: usize = HANDLES_LEN + MAGIC_LEN;
pub const ROCKSDB_FOOTER_LEN: usize = 1 + HANDLES_LEN + 4 + MAGIC_LEN;
pub const MIN_FOOTER_LEN: usize = LEVELDB_FOOTER_LEN;
pub const MAX_FOOTER_LEN: usize = ROCKSDB_FOOTER_LEN;

const ROCKSDB_VERSION_OFFSET: usize = ROCKSDB_FOOTER_LEN - MAGIC_LEN - 4;
const ROCKSDB_EXTERNAL_FORMAT_VERSION: u32 = 2;

/// Location of a block within a file, trailer excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.offset);
        put_uvarint(buf, self.length);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Option<(BlockHandle, usize)> {
        let (offset, n) = uvarint(buf)?;
        let (length, m) = uvarint(&buf[n..])?;
        Some((BlockHandle { offset, length }, n + m))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    None = 0,
    Crc32 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    LevelDb,
    RocksDb,
    /// Native format with its version.
    Shoal(u32),
}

impl TableFormat {
    /// The format every new table is written in.
    pub const CURRENT: TableFormat = TableFormat::Shoal(2);

    pub fn magic(&self) -> &'static [u8; 8] {
        match self {
            TableFormat::LevelDb => LEVELDB_MAGIC,
            TableFormat::RocksDb => ROCKSDB_MAGIC,
            TableFormat::Shoal(_) => SHOAL_MAGIC,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            TableFormat::LevelDb => 0,
            TableFormat::RocksDb => ROCKSDB_EXTERNAL_FORMAT_VERSION,
            TableFormat::Shoal(v) => *v,
        }
    }

    pub fn footer_len(&self) -> usize {
        match self {
            TableFormat::LevelDb => LEVELDB_FOOTER_LEN,
            TableFormat::RocksDb | TableFormat::Shoal(_) => ROCKSDB_FOOTER_LEN,
        }
    }

    /// True if data blocks may hold blob handles and the file may carry a
    /// range-key block.
    pub fn supports_value_blocks(&self) -> bool {
        matches!(self, TableFormat::Shoal(v) if *v >= 2)
    }

    fn parse(magic: &[u8], version: u32) -> Result<TableFormat> {
        let format = if magic == ROCKSDB_MAGIC {
            (version == ROCKSDB_EXTERNAL_FORMAT_VERSION).then_some(TableFormat::RocksDb)
        } else {
            (version == 1 || version == 2).then_some(TableFormat::Shoal(version))
        };
        format.ok_or_else(|| corruption(format!("unknown table format version {}", version)))
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableFormat::LevelDb => write!(f, "leveldb"),
            TableFormat::RocksDb => write!(f, "rocksdb.v2"),
            TableFormat::Shoal(v) => write!(f, "shoal.v{}", v),
        }
    }
}

/// Parsed sorted file footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub format: TableFormat,
    pub checksum: ChecksumType,
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut handles = Vec::with_capacity(HANDLES_LEN);
        self.metaindex.encode_into(&mut handles);
        self.index.encode_into(&mut handles);
        handles.resize(HANDLES_LEN, 0);

        let mut buf = Vec::with_capacity(self.format.footer_len());
        match self.format {
            TableFormat::LevelDb => {
                buf.extend_from_slice(&handles);
            }
            TableFormat::RocksDb | TableFormat::Shoal(_) => {
                buf.push(self.checksum as u8);
                buf.extend_from_slice(&handles);
                let mut v = [0u8; 4];
                LittleEndian::write_u32(&mut v, self.format.version());
                buf.extend_from_slice(&v);
            }
        }
        buf.extend_from_slice(self.format.magic());
        buf
    }

    /// Parses the footer from `buf`, the last bytes of a file of `size`
    /// bytes.
    ///
    /// # Errors
    ///
    /// Every malformed footer is a corruption error: unknown magic, a
    /// buffer too short for the detected layout, an unsupported checksum
    /// type or format version, and handles that do not decode or that
    /// point past the end of the file.
    pub fn parse(buf: &[u8], size: u64) -> Result<Footer> {
        if buf.len() < MIN_FOOTER_LEN {
            return Err(corruption(format!("footer too short: {} bytes", buf.len())));
        }
        let magic = &buf[buf.len() - MAGIC_LEN..];
        let (format, checksum, handles) = if magic == LEVELDB_MAGIC {
            let buf = &buf[buf.len() - LEVELDB_FOOTER_LEN..];
            (TableFormat::LevelDb, ChecksumType::Crc32, buf)
        } else if magic == ROCKSDB_MAGIC || magic == SHOAL_MAGIC {
            if buf.len() < ROCKSDB_FOOTER_LEN {
                return Err(corruption(format!("footer too short: {} bytes", buf.len())));
            }
            let buf = &buf[buf.len() - ROCKSDB_FOOTER_LEN..];
            let version =
                LittleEndian::read_u32(&buf[ROCKSDB_VERSION_OFFSET..ROCKSDB_VERSION_OFFSET + 4]);
            let format = TableFormat::parse(magic, version)?;
            let checksum = match buf[0] {
                0 => ChecksumType::None,
                1 => ChecksumType::Crc32,
                other => {
                    return Err(corruption(format!("unsupported checksum type {}", other)))
                }
            };
            (format, checksum, &buf[1..])
        } else {
            return Err(corruption(format!("bad magic number: {:02x?}", magic)));
        };

        let (metaindex, n) = BlockHandle::decode(handles)
            .filter(|(h, _)| within(h, size))
            .ok_or_else(|| corruption("bad metaindex block handle"))?;
        let (index, _) = BlockHandle::decode(&handles[n..])
            .filter(|(h, _)| within(h, size))
            .ok_or_else(|| corruption("bad index block handle"))?;

        Ok(Footer {
            format,
            checksum,
            metaindex,
            index,
        })
    }
}

fn within(h: &BlockHandle, size: u64) -> bool {
    h.offset
        .checked_add(h.length)
        .map_or(false, |end| end <= size)
}

/// Reads and parses the footer of `r`.
pub fn read_footer(r: &dyn Readable) -> Result<Footer> {
    let size = r.size();
    if size < MIN_FOOTER_LEN as u64 {
        return Err(corruption(format!(
            "invalid table (file size {} is too small)",
            size
        )));
    }
    let len = size.min(MAX_FOOTER_LEN as u64);
    let buf = r.read_at(size - len, len as usize)?;
    Footer::parse(&buf, size)
}
