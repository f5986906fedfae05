//! Caches of open table and blob file readers.
//!
//! Table readers are kept in a small LRU keyed by physical file number so
//! virtual files sharing a backing share one reader. Blob readers are
//! kept until their file becomes obsolete.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use base::{corruption, BlobValue, Comparer, ValueFetcher};
use parking_lot::Mutex;
use sstable::{BlobFileReader, ObjectStore, TableReader};
use tracing::debug;

use crate::file_metadata::FileMetadata;
use crate::filenames::{blob_name, table_name};

struct Lru {
    tables: HashMap<u64, (Arc<TableReader>, u64)>,
    tick: u64,
}

pub struct FileCache {
    store: Arc<dyn ObjectStore>,
    cmp: &'static Comparer,
    capacity: usize,
    lru: Mutex<Lru>,
    blobs: Mutex<HashMap<u64, Arc<BlobFileReader>>>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("capacity", &self.capacity)
            .field("open_tables", &self.lru.lock().tables.len())
            .field("open_blobs", &self.blobs.lock().len())
            .finish()
    }
}

impl FileCache {
    pub fn new(store: Arc<dyn ObjectStore>, cmp: &'static Comparer, capacity: usize) -> Self {
        Self {
            store,
            cmp,
            capacity: capacity.max(1),
            lru: Mutex::new(Lru {
                tables: HashMap::new(),
                tick: 0,
            }),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// The reader for the physical table behind `file`.
    pub fn table(&self, file: &FileMetadata) -> Result<Arc<TableReader>> {
        self.table_by_num(file.backing.disk_file_num)
    }

    pub fn table_by_num(&self, num: u64) -> Result<Arc<TableReader>> {
        {
            let mut lru = self.lru.lock();
            lru.tick += 1;
            let tick = lru.tick;
            if let Some((reader, used)) = lru.tables.get_mut(&num) {
                *used = tick;
                return Ok(Arc::clone(reader));
            }
        }

        // Opened outside the lock; a racing open of the same file just
        // loses the insert below.
        let name = table_name(num);
        let readable = self
            .store
            .open(&name)
            .with_context(|| format!("failed to open table {}", name))?;
        let reader = Arc::new(
            TableReader::open(readable, self.cmp)
                .with_context(|| format!("failed to read table {}", name))?,
        );
        debug!(file = %name, "opened table");

        let mut lru = self.lru.lock();
        lru.tick += 1;
        let tick = lru.tick;
        let reader = Arc::clone(
            &lru.tables
                .entry(num)
                .or_insert_with(|| (reader, tick))
                .0,
        );
        if lru.tables.len() > self.capacity {
            let victim = lru
                .tables
                .iter()
                .filter(|(n, _)| **n != num)
                .min_by_key(|(_, (_, used))| *used)
                .map(|(n, _)| *n);
            if let Some(v) = victim {
                lru.tables.remove(&v);
            }
        }
        Ok(reader)
    }

    pub fn blob(&self, num: u64) -> Result<Arc<BlobFileReader>> {
        if let Some(r) = self.blobs.lock().get(&num) {
            return Ok(Arc::clone(r));
        }
        let name = blob_name(num);
        let readable = self
            .store
            .open(&name)
            .with_context(|| format!("failed to open blob file {}", name))?;
        let reader = Arc::new(BlobFileReader::open(readable)?);
        debug!(file = %name, "opened blob file");
        Ok(Arc::clone(
            self.blobs.lock().entry(num).or_insert(reader),
        ))
    }

    /// Forgets any reader for file `num`.
    pub fn evict(&self, num: u64) {
        self.lru.lock().tables.remove(&num);
        self.blobs.lock().remove(&num);
    }

    pub fn open_tables(&self) -> usize {
        self.lru.lock().tables.len()
    }
}

impl ValueFetcher for FileCache {
    fn fetch(&self, value: &BlobValue) -> Result<Vec<u8>> {
        let reader = self.blob(value.file_num)?;
        let bytes = reader.read(&value.handle)?;
        if bytes.len() != value.handle.value_len as usize {
            return Err(corruption(format!(
                "blob {:06} returned {} bytes, expected {}",
                value.file_num,
                bytes.len(),
                value.handle.value_len
            )));
        }
        Ok(bytes)
    }
}
