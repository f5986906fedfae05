//! # WAL - Write-Ahead Log
//!
//! Provides crash-safe durability for the Shoal storage engine.
//!
//! Every mutation is serialized into a binary record and appended to the
//! WAL **before** the corresponding memtable update. On restart the WAL is
//! replayed to reconstruct the memtable, guaranteeing that no acknowledged
//! write is lost.
//!
//! The framing layer ([`LogWriter`] / [`LogReader`]) is payload-agnostic;
//! the engine's manifest reuses it for version edits.
//!
//! ## Frame Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! `record_len` includes the 4-byte CRC but **not** itself.
//!
//! ## WAL Record Bodies
//!
//! ```text
//! Point: [seq: u64][kind: u8][key_len: u32][key][val_len: u32][value]
//! Span:  [seq: u64][kind: u8][start_len: u32][start][end_len: u32][end]
//!        [suffix_len: u32][suffix][val_len: u32][value]
//! ```
//!
//! `kind` is the internal key kind byte; point kinds are SET, DEL,
//! SINGLEDEL and MERGE, span kinds are RANGEDEL and the three range key
//! kinds.
//!
//! ## Example
//!
//! ```rust,no_run
//! use base::InternalKeyKind;
//! use wal::{WalReader, WalRecord, WalWriter};
//!
//! let mut w = WalWriter::create("000001.log", true).unwrap();
//! w.append(&WalRecord::Point {
//!     seq: 1,
//!     kind: InternalKeyKind::Set,
//!     key: b"hello".to_vec(),
//!     value: b"world".to_vec(),
//! }).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("000001.log").unwrap();
//! r.replay(|rec| println!("{:?}", rec)).unwrap();
//! ```

use base::{InternalKeyKind, SeqNum};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Upper bound on a single frame; larger lengths are treated as corruption.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A single WAL record: one committed write.
///
/// Each record carries the **sequence number** assigned at commit, which
/// replay restores verbatim so snapshot visibility survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// SET, DEL, SINGLEDEL or MERGE of one key. `value` is empty for
    /// deletions.
    Point {
        seq: SeqNum,
        kind: InternalKeyKind,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// A range deletion or range key operation over `[start, end)`.
    Span {
        seq: SeqNum,
        kind: InternalKeyKind,
        start: Vec<u8>,
        end: Vec<u8>,
        suffix: Vec<u8>,
        value: Vec<u8>,
    },
}

impl WalRecord {
    pub fn seq(&self) -> SeqNum {
        match self {
            WalRecord::Point { seq, .. } | WalRecord::Span { seq, .. } => *seq,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        fn put(buf: &mut Vec<u8>, data: &[u8]) -> io::Result<()> {
            let len = u32::try_from(data.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "WAL field exceeds u32::MAX bytes")
            })?;
            buf.write_u32::<LittleEndian>(len)?;
            buf.extend_from_slice(data);
            Ok(())
        }
        match self {
            WalRecord::Point {
                seq,
                kind,
                key,
                value,
            } => {
                buf.write_u64::<LittleEndian>(*seq)?;
                buf.write_u8(*kind as u8)?;
                put(buf, key)?;
                put(buf, value)?;
            }
            WalRecord::Span {
                seq,
                kind,
                start,
                end,
                suffix,
                value,
            } => {
                buf.write_u64::<LittleEndian>(*seq)?;
                buf.write_u8(*kind as u8)?;
                put(buf, start)?;
                put(buf, end)?;
                put(buf, suffix)?;
                put(buf, value)?;
            }
        }
        Ok(())
    }

    fn decode(body: &[u8]) -> Result<Self, WalError> {
        fn take(br: &mut &[u8]) -> Result<Vec<u8>, WalError> {
            let len = br.read_u32::<LittleEndian>()? as usize;
            if len > br.len() {
                return Err(WalError::Corrupt);
            }
            let (head, tail) = br.split_at(len);
            *br = tail;
            Ok(head.to_vec())
        }

        let mut br = body;
        let seq = br.read_u64::<LittleEndian>()?;
        let kind = InternalKeyKind::from_u8(br.read_u8()?).ok_or(WalError::Corrupt)?;
        let rec = if kind.is_point() {
            let key = take(&mut br)?;
            let value = take(&mut br)?;
            WalRecord::Point {
                seq,
                kind,
                key,
                value,
            }
        } else if kind == InternalKeyKind::RangeDelete || kind.is_range_key() {
            let start = take(&mut br)?;
            let end = take(&mut br)?;
            let suffix = take(&mut br)?;
            let value = take(&mut br)?;
            WalRecord::Span {
                seq,
                kind,
                start,
                end,
                suffix,
                value,
            }
        } else {
            return Err(WalError::Corrupt);
        };
        if !br.is_empty() {
            return Err(WalError::Corrupt);
        }
        Ok(rec)
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or contained an unknown kind.
    #[error("corrupt record")]
    Corrupt,
}

/// Append-only writer of CRC-framed records.
///
/// Frames are assembled in a reusable buffer and written with a single
/// `write_all` call. When `sync` is `true`, every append is followed by
/// `sync_all()` (fsync).
pub struct LogWriter {
    file: File,
    sync: bool,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
    size: u64,
}

impl LogWriter {
    /// Opens (or creates) a log file in append mode.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            sync,
            buf: Vec::with_capacity(256),
            size,
        })
    }

    /// Frames `body` and appends it.
    pub fn append(&mut self, body: &[u8]) -> Result<(), WalError> {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 8]);
        self.buf.extend_from_slice(body);
        self.write_frame()
    }

    /// Like [`LogWriter::append`], letting `fill` serialize straight into
    /// the frame buffer.
    fn append_with<F>(&mut self, fill: F) -> Result<(), WalError>
    where
        F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
    {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 8]);
        fill(&mut self.buf)?;
        self.write_frame()
    }

    fn write_frame(&mut self) -> Result<(), WalError> {
        let body = &self.buf[8..];

        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        // record_len = body.len() + 4 (CRC), must fit the replay cap
        let record_len = (body.len() as u64) + 4;
        if record_len > u64::from(MAX_RECORD_SIZE) {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "log record too large",
            )));
        }

        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        // Single write call for the entire frame
        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        self.size += self.buf.len() as u64;

        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Forces all written data to disk via `sync_all()`.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Bytes in the file, including frames written before it was opened.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Sequential reader of CRC-framed records.
///
/// The reader is generic over any `Read` implementor, allowing it to be used
/// with real files or in-memory buffers for testing. A truncated tail frame
/// (e.g., from a crash mid-write) is treated as a clean EOF.
pub struct LogReader<R: Read> {
    rdr: BufReader<R>,
    body: Vec<u8>,
}

impl LogReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<LogReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(Self::from_reader(f))
    }
}

impl<R: Read> LogReader<R> {
    pub fn from_reader(reader: R) -> Self {
        LogReader {
            rdr: BufReader::new(reader),
            body: Vec::with_capacity(256),
        }
    }

    /// Returns the next record body, or `None` at EOF or a truncated tail.
    ///
    /// # Errors
    ///
    /// - **CRC mismatch** or absurd length -> `WalError::Corrupt`.
    /// - **I/O error** -> `WalError::Io(...)`.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, WalError> {
        let record_len = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        };

        // record_len includes CRC (4 bytes) but not itself
        if record_len <= 4 || record_len > MAX_RECORD_SIZE {
            return Err(WalError::Corrupt);
        }

        let crc = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        };

        let body_len = (record_len - 4) as usize;
        self.body.clear();
        self.body.resize(body_len, 0);
        match self.rdr.read_exact(&mut self.body) {
            Ok(()) => {}
            // truncated tail — treat as EOF
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        }

        let mut hasher = Crc32::new();
        hasher.update(&self.body);
        if hasher.finalize() != crc {
            return Err(WalError::Corrupt);
        }
        Ok(Some(&self.body))
    }
}

/// Append-only WAL writer.
///
/// Tracks the highest sequence number known to be durable: after every
/// append when `sync` is on, after [`WalWriter::sync_to_disk`] otherwise.
pub struct WalWriter {
    log: LogWriter,
    sync: bool,
    last_seq: SeqNum,
    durable_seq: SeqNum,
}

impl WalWriter {
    /// Opens (or creates) a WAL file in append mode.
    ///
    /// # Arguments
    ///
    /// * `path` - file system path for the WAL (created if it does not exist).
    /// * `sync` - if true, every `append` call is followed by `fsync`.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        Ok(Self {
            log: LogWriter::create(path, sync)?,
            sync,
            last_seq: 0,
            durable_seq: 0,
        })
    }

    /// Serializes `record` and appends it to the WAL file.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.log.append_with(|buf| record.encode(buf))?;
        self.last_seq = self.last_seq.max(record.seq());
        if self.sync {
            self.durable_seq = self.last_seq;
        }
        Ok(())
    }

    /// Forces all buffered data to disk, making every appended record
    /// durable.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.log.sync_to_disk()?;
        self.durable_seq = self.last_seq;
        Ok(())
    }

    /// Highest sequence number persisted to stable storage.
    pub fn durable_seq(&self) -> SeqNum {
        self.durable_seq
    }

    pub fn size(&self) -> u64 {
        self.log.size()
    }
}

/// Sequential WAL reader that yields valid records.
///
/// During replay, each record's CRC32 is verified. A truncated tail record
/// is treated as a clean EOF — all fully-written records before it are
/// still returned.
pub struct WalReader<R: Read> {
    log: LogReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    ///
    /// Returns `WalError::Io` if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        Ok(WalReader {
            log: LogReader::open(path)?,
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            log: LogReader::from_reader(reader),
        }
    }

    /// Replays every valid record in the WAL, calling `apply` for each one.
    ///
    /// # Termination
    ///
    /// - **Clean EOF** or **truncated tail** -> returns `Ok(())`.
    /// - **CRC mismatch** or **unknown kind** -> returns `Err(WalError::Corrupt)`.
    /// - **I/O error** -> returns `Err(WalError::Io(...))`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(WalRecord),
    {
        while let Some(body) = self.log.next_record()? {
            apply(WalRecord::decode(body)?);
        }
        Ok(())
    }
}
