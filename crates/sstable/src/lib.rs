//! # SSTable - sorted files and blob files
//!
//! Immutable on-disk storage for the Shoal engine. Flushes and compactions
//! stream internal keys into a [`TableWriter`]; readers open tables through
//! an [`ObjectStore`] and iterate them with [`TableIter`]. Large values may
//! live in separate blob files written by [`BlobFileWriter`].
//!
//! ## Table layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA BLOCKS   internal key -> prefixed value                   │
//! │               prefix 0: inline value bytes                     │
//! │               prefix 1: blob handle varints + short attribute  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX BLOCK   last key of each data block -> block handle      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FILTER        bloom filter over key prefixes (optional)        │
//! │ RANGE-DEL     fragmented range deletions (optional)            │
//! │ RANGE-KEY     fragmented range keys (optional)                 │
//! │ PROPERTIES    name -> u64 LE                                   │
//! │ METAINDEX     block name -> block handle                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER        53 bytes, see [`format`]                         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every block is followed by a type byte and a CRC32 checksum.

mod blob;
mod block;
pub mod format;
mod merge;
mod objstorage;
mod properties;
mod reader;
mod writer;

pub use blob::{BlobFileReader, BlobFileStats, BlobFileWriter};
pub use format::{BlockHandle, ChecksumType, Footer, TableFormat};
pub use merge::MergingIter;
pub use objstorage::{FsObjectStore, ObjectStore, Readable, Writable};
pub use properties::Properties;
pub use reader::{TableIter, TableIterOptions, TableReader};
pub use writer::{TableWriter, WriterMetadata, WriterOptions};

#[cfg(test)]
mod tests;
