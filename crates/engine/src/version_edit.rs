//! Version edits: the deltas persisted in the manifest.
//!
//! An edit is a sequence of tagged fields. Every field starts with a varint
//! tag; decoding an unknown tag is a corruption error rather than a skip,
//! since a manifest written by a newer format cannot be replayed safely.
//!
//! ```text
//! 1  comparer name         length-prefixed
//! 2  log number            varint (minimum unflushed WAL)
//! 3  next file number      varint
//! 4  last sequence number  varint
//! 5  deleted file          level, file number
//! 6  new file              level, file fields (see encode_file)
//! 7  new blob file         file number, size, value size, creation time
//! 8  deleted blob file     file number
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use base::encoding::{put_length_prefixed, put_uvarint, Decoder};
use base::{corruption, invariant, Comparer, InternalKey, SeqNum};

use crate::file_metadata::{BlobFileMetadata, BlobReference, FileBacking, FileMetadata, TableStats};
use crate::version::{Version, NUM_LEVELS};

const TAG_COMPARER: u64 = 1;
const TAG_LOG_NUMBER: u64 = 2;
const TAG_NEXT_FILE_NUM: u64 = 3;
const TAG_LAST_SEQ: u64 = 4;
const TAG_DELETED_FILE: u64 = 5;
const TAG_NEW_FILE: u64 = 6;
const TAG_NEW_BLOB_FILE: u64 = 7;
const TAG_DELETED_BLOB_FILE: u64 = 8;

const FLAG_POINT_BOUNDS: u64 = 1;
const FLAG_RANGE_KEY_BOUNDS: u64 = 1 << 1;
const FLAG_VIRTUAL: u64 = 1 << 2;

#[derive(Default, Clone)]
pub struct VersionEdit {
    pub comparer_name: Option<String>,
    /// WAL files numbered below this have been flushed.
    pub log_number: Option<u64>,
    pub next_file_num: Option<u64>,
    pub last_seq: Option<SeqNum>,
    /// `(level, file number)`
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, Arc<FileMetadata>)>,
    pub new_blob_files: Vec<Arc<BlobFileMetadata>>,
    pub deleted_blob_files: BTreeSet<u64>,
}

impl fmt::Debug for VersionEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("VersionEdit");
        if let Some(name) = &self.comparer_name {
            d.field("comparer", name);
        }
        if let Some(n) = self.log_number {
            d.field("log_number", &n);
        }
        if let Some(n) = self.next_file_num {
            d.field("next_file_num", &n);
        }
        if let Some(n) = self.last_seq {
            d.field("last_seq", &n);
        }
        if !self.deleted_files.is_empty() {
            d.field("deleted", &self.deleted_files);
        }
        if !self.new_files.is_empty() {
            d.field("added", &self.new_files);
        }
        if !self.new_blob_files.is_empty() {
            d.field("added_blobs", &self.new_blob_files);
        }
        if !self.deleted_blob_files.is_empty() {
            d.field("deleted_blobs", &self.deleted_blob_files);
        }
        d.finish()
    }
}

fn put_key(buf: &mut Vec<u8>, key: &InternalKey) {
    put_length_prefixed(buf, &key.encode());
}

fn get_key(d: &mut Decoder<'_>) -> Result<InternalKey> {
    InternalKey::decode(d.length_prefixed()?)
}

fn check_level(level: u64) -> Result<usize> {
    if level as usize >= NUM_LEVELS {
        return Err(corruption(format!("level {} out of range", level)));
    }
    Ok(level as usize)
}

impl VersionEdit {
    pub fn add_file(&mut self, level: usize, file: Arc<FileMetadata>) {
        self.new_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, file_num: u64) {
        self.deleted_files.insert((level, file_num));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparer_name {
            put_uvarint(&mut buf, TAG_COMPARER);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_uvarint(&mut buf, TAG_LOG_NUMBER);
            put_uvarint(&mut buf, n);
        }
        if let Some(n) = self.next_file_num {
            put_uvarint(&mut buf, TAG_NEXT_FILE_NUM);
            put_uvarint(&mut buf, n);
        }
        if let Some(n) = self.last_seq {
            put_uvarint(&mut buf, TAG_LAST_SEQ);
            put_uvarint(&mut buf, n);
        }
        for &(level, num) in &self.deleted_files {
            put_uvarint(&mut buf, TAG_DELETED_FILE);
            put_uvarint(&mut buf, level as u64);
            put_uvarint(&mut buf, num);
        }
        for (level, f) in &self.new_files {
            put_uvarint(&mut buf, TAG_NEW_FILE);
            put_uvarint(&mut buf, *level as u64);
            encode_file(&mut buf, f);
        }
        for b in &self.new_blob_files {
            put_uvarint(&mut buf, TAG_NEW_BLOB_FILE);
            put_uvarint(&mut buf, b.file_num);
            put_uvarint(&mut buf, b.size);
            put_uvarint(&mut buf, b.value_size);
            put_uvarint(&mut buf, b.creation_time);
        }
        for &num in &self.deleted_blob_files {
            put_uvarint(&mut buf, TAG_DELETED_BLOB_FILE);
            put_uvarint(&mut buf, num);
        }
        buf
    }

    /// Decodes an edit.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for unknown tags, truncated fields and
    /// out-of-range levels.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let mut edit = VersionEdit::default();
        while !d.is_empty() {
            match d.uvarint()? {
                TAG_COMPARER => {
                    let name = std::str::from_utf8(d.length_prefixed()?)
                        .map_err(|_| corruption("comparer name is not UTF-8"))?;
                    edit.comparer_name = Some(name.to_string());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(d.uvarint()?),
                TAG_NEXT_FILE_NUM => edit.next_file_num = Some(d.uvarint()?),
                TAG_LAST_SEQ => edit.last_seq = Some(d.uvarint()?),
                TAG_DELETED_FILE => {
                    let level = check_level(d.uvarint()?)?;
                    edit.deleted_files.insert((level, d.uvarint()?));
                }
                TAG_NEW_FILE => {
                    let level = check_level(d.uvarint()?)?;
                    edit.new_files.push((level, Arc::new(decode_file(&mut d)?)));
                }
                TAG_NEW_BLOB_FILE => {
                    let file_num = d.uvarint()?;
                    let size = d.uvarint()?;
                    let value_size = d.uvarint()?;
                    let creation_time = d.uvarint()?;
                    edit.new_blob_files.push(Arc::new(BlobFileMetadata::new(
                        file_num,
                        size,
                        value_size,
                        creation_time,
                    )));
                }
                TAG_DELETED_BLOB_FILE => {
                    edit.deleted_blob_files.insert(d.uvarint()?);
                }
                tag => return Err(corruption(format!("unknown version edit tag {}", tag))),
            }
        }
        Ok(edit)
    }
}

fn encode_file(buf: &mut Vec<u8>, f: &FileMetadata) {
    put_uvarint(buf, f.file_num);
    put_uvarint(buf, f.size);
    put_key(buf, &f.smallest);
    put_key(buf, &f.largest);

    let point_bounds = f.smallest_point.as_ref().zip(f.largest_point.as_ref());
    let range_key_bounds = f.smallest_range_key.as_ref().zip(f.largest_range_key.as_ref());
    let mut flags = 0;
    if point_bounds.is_some() {
        flags |= FLAG_POINT_BOUNDS;
    }
    if range_key_bounds.is_some() {
        flags |= FLAG_RANGE_KEY_BOUNDS;
    }
    if f.is_virtual {
        flags |= FLAG_VIRTUAL;
    }
    put_uvarint(buf, flags);
    if let Some((s, l)) = point_bounds {
        put_key(buf, s);
        put_key(buf, l);
    }
    if let Some((s, l)) = range_key_bounds {
        put_key(buf, s);
        put_key(buf, l);
    }
    put_uvarint(buf, f.smallest_seq);
    put_uvarint(buf, f.largest_seq);

    let s = &f.stats;
    for v in [
        s.num_entries,
        s.num_deletions,
        s.num_range_deletions,
        s.num_range_keys,
        s.point_deletions_bytes_estimate,
        s.range_deletions_bytes_estimate,
    ] {
        put_uvarint(buf, v);
    }
    if f.is_virtual {
        put_uvarint(buf, f.backing.disk_file_num);
        put_uvarint(buf, f.backing.size);
    }
    put_uvarint(buf, f.blob_references.len() as u64);
    for r in &f.blob_references {
        put_uvarint(buf, r.file_num);
        put_uvarint(buf, r.value_size);
    }
    put_uvarint(buf, f.blob_reference_depth as u64);
}

fn decode_file(d: &mut Decoder<'_>) -> Result<FileMetadata> {
    let file_num = d.uvarint()?;
    let size = d.uvarint()?;
    let smallest = get_key(d)?;
    let largest = get_key(d)?;
    let flags = d.uvarint()?;
    if flags & !(FLAG_POINT_BOUNDS | FLAG_RANGE_KEY_BOUNDS | FLAG_VIRTUAL) != 0 {
        return Err(corruption(format!("unknown file flags {:#x}", flags)));
    }
    let point_bounds = if flags & FLAG_POINT_BOUNDS != 0 {
        Some((get_key(d)?, get_key(d)?))
    } else {
        None
    };
    let range_key_bounds = if flags & FLAG_RANGE_KEY_BOUNDS != 0 {
        Some((get_key(d)?, get_key(d)?))
    } else {
        None
    };
    let smallest_seq = d.uvarint()?;
    let largest_seq = d.uvarint()?;
    let stats = TableStats {
        num_entries: d.uvarint()?,
        num_deletions: d.uvarint()?,
        num_range_deletions: d.uvarint()?,
        num_range_keys: d.uvarint()?,
        point_deletions_bytes_estimate: d.uvarint()?,
        range_deletions_bytes_estimate: d.uvarint()?,
    };
    let is_virtual = flags & FLAG_VIRTUAL != 0;
    let backing = if is_virtual {
        let num = d.uvarint()?;
        FileBacking::new(num, d.uvarint()?)
    } else {
        FileBacking::new(file_num, size)
    };
    let nrefs = d.uvarint()?;
    let mut refs = Vec::with_capacity(nrefs.min(64) as usize);
    for _ in 0..nrefs {
        refs.push(BlobReference {
            file_num: d.uvarint()?,
            value_size: d.uvarint()?,
        });
    }
    let depth = d.uvarint()? as usize;

    let mut f = FileMetadata::new(
        file_num,
        size,
        smallest,
        largest,
        smallest_seq,
        largest_seq,
        backing,
        is_virtual,
    )
    .with_stats(stats)
    .with_blob_references(refs, depth);
    f.smallest_point = None;
    f.largest_point = None;
    if let Some((s, l)) = point_bounds {
        f.smallest_point = Some(s);
        f.largest_point = Some(l);
    }
    if let Some((s, l)) = range_key_bounds {
        f.smallest_range_key = Some(s);
        f.largest_range_key = Some(l);
    }
    Ok(f)
}

/// File lists of a version under construction.
pub struct VersionParts {
    pub levels: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    pub blob_files: BTreeMap<u64, Arc<BlobFileMetadata>>,
}

impl VersionParts {
    /// Blob files no table refers to any more.
    pub fn unreferenced_blob_files(&self) -> Vec<u64> {
        let referenced: BTreeSet<u64> = self
            .levels
            .iter()
            .flatten()
            .flat_map(|f| f.blob_references.iter().map(|r| r.file_num))
            .collect();
        self.blob_files
            .keys()
            .filter(|n| !referenced.contains(n))
            .copied()
            .collect()
    }
}

/// Accumulates any number of edits and applies them to a base version in
/// one step. Recovery folds a whole manifest into one of these so that no
/// intermediate version is ever built.
#[derive(Default)]
pub struct BulkVersionEdit {
    added: [BTreeMap<u64, Arc<FileMetadata>>; NUM_LEVELS],
    deleted: [BTreeSet<u64>; NUM_LEVELS],
    added_blobs: BTreeMap<u64, Arc<BlobFileMetadata>>,
    deleted_blobs: BTreeSet<u64>,
}

impl BulkVersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, edit: &VersionEdit) -> Result<()> {
        for &(level, num) in &edit.deleted_files {
            if level >= NUM_LEVELS {
                return Err(invariant(format!("level {} out of range", level)));
            }
            if self.added[level].remove(&num).is_none() {
                self.deleted[level].insert(num);
            }
        }
        for (level, f) in &edit.new_files {
            if *level >= NUM_LEVELS {
                return Err(invariant(format!("level {} out of range", level)));
            }
            self.added[*level].insert(f.file_num, Arc::clone(f));
        }
        for &num in &edit.deleted_blob_files {
            if self.added_blobs.remove(&num).is_none() {
                self.deleted_blobs.insert(num);
            }
        }
        for b in &edit.new_blob_files {
            self.added_blobs.insert(b.file_num, Arc::clone(b));
        }
        Ok(())
    }

    /// The file lists of `base` with the accumulated edits applied.
    ///
    /// # Errors
    ///
    /// Returns an invariant error when a deleted file is missing from its
    /// level or an added file number is already live.
    pub fn apply(&self, base: &Version, cmp: &Comparer) -> Result<VersionParts> {
        let mut live: BTreeSet<u64> = BTreeSet::new();
        let mut backings: BTreeMap<u64, Arc<FileBacking>> = BTreeMap::new();
        let mut levels: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();

        for (level, files) in levels.iter_mut().enumerate() {
            for num in &self.deleted[level] {
                if !base.files(level).iter().any(|f| f.file_num == *num) {
                    return Err(invariant(format!(
                        "deleted file {:06} not found in L{}",
                        num, level
                    )));
                }
            }
            for f in base.files(level) {
                if self.deleted[level].contains(&f.file_num) {
                    continue;
                }
                live.insert(f.file_num);
                backings
                    .entry(f.backing.disk_file_num)
                    .or_insert_with(|| Arc::clone(&f.backing));
                files.push(Arc::clone(f));
            }
        }

        for (level, files) in levels.iter_mut().enumerate() {
            for f in self.added[level].values() {
                if !live.insert(f.file_num) {
                    return Err(invariant(format!(
                        "file {:06} added to L{} is already live",
                        f.file_num, level
                    )));
                }
                let f = match backings.get(&f.backing.disk_file_num) {
                    Some(b) if !Arc::ptr_eq(b, &f.backing) => Arc::new(f.with_backing(Arc::clone(b))),
                    Some(_) => Arc::clone(f),
                    None => {
                        backings.insert(f.backing.disk_file_num, Arc::clone(&f.backing));
                        Arc::clone(f)
                    }
                };
                files.push(f);
            }
            if level == 0 {
                files.sort_by(|a, b| {
                    (a.largest_seq, a.smallest_seq, a.file_num)
                        .cmp(&(b.largest_seq, b.smallest_seq, b.file_num))
                });
            } else {
                files.sort_by(|a, b| {
                    cmp.cmp_internal(&a.smallest, &b.smallest)
                        .then_with(|| a.file_num.cmp(&b.file_num))
                });
            }
        }

        let mut blob_files = base.blob_files().clone();
        for num in &self.deleted_blobs {
            if blob_files.remove(num).is_none() {
                return Err(invariant(format!("deleted blob file {:06} not found", num)));
            }
        }
        for (num, b) in &self.added_blobs {
            if blob_files.insert(*num, Arc::clone(b)).is_some() {
                return Err(invariant(format!("blob file {:06} is already live", num)));
            }
        }

        Ok(VersionParts { levels, blob_files })
    }
}
