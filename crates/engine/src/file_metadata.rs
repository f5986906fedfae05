//! Descriptors of sorted files and blob files.
//!
//! A [`FileMetadata`] is immutable once built and shared (`Arc`) by every
//! version that lists it. The physical object behind it is a
//! [`FileBacking`], which carries the reference count that decides when
//! the object may be deleted: each live version holding the file counts
//! once, and several virtual files may share one backing.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use base::{Comparer, InternalKey, SeqNum};
use sstable::{TableIterOptions, WriterMetadata};

/// A physical object and the number of versions referencing it.
pub struct FileBacking {
    pub disk_file_num: u64,
    pub size: u64,
    refs: AtomicUsize,
}

impl FileBacking {
    pub fn new(disk_file_num: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            disk_file_num,
            size,
            refs: AtomicUsize::new(0),
        })
    }

    pub fn refs(&self) -> usize {
        self.refs.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Drops one reference; true when it was the last.
    pub(crate) fn release(&self) -> bool {
        self.refs.fetch_sub(1, AtomicOrdering::AcqRel) == 1
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}(refs={})", self.disk_file_num, self.refs())
    }
}

/// Per-table statistics used by the picker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_range_deletions: u64,
    pub num_range_keys: u64,
    /// Bytes that compacting the point tombstones would likely reclaim.
    pub point_deletions_bytes_estimate: u64,
    /// Bytes of lower-level data fully covered by the range deletions.
    pub range_deletions_bytes_estimate: u64,
}

/// A table's reference to one blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobReference {
    pub file_num: u64,
    /// Bytes of values the table holds in that file.
    pub value_size: u64,
}

pub struct FileMetadata {
    pub file_num: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_point: Option<InternalKey>,
    pub largest_point: Option<InternalKey>,
    pub smallest_range_key: Option<InternalKey>,
    pub largest_range_key: Option<InternalKey>,
    pub smallest_seq: SeqNum,
    pub largest_seq: SeqNum,
    pub stats: TableStats,
    /// A bounded sub-range of a backing shared with other files.
    pub is_virtual: bool,
    pub backing: Arc<FileBacking>,
    /// Indexed by the reference index stored in blob handles.
    pub blob_references: Vec<BlobReference>,
    /// Worst-case number of blob files a read of this table's key range
    /// may touch.
    pub blob_reference_depth: usize,
    compacting: AtomicBool,
}

impl FileMetadata {
    /// Describes a freshly written physical table.
    pub fn from_writer(
        file_num: u64,
        meta: &WriterMetadata,
        cmp: &Comparer,
        blob_references: Vec<BlobReference>,
        blob_reference_depth: usize,
    ) -> Option<Self> {
        let smallest = meta.smallest(cmp)?;
        let largest = meta.largest(cmp)?;
        let p = &meta.properties;
        let avg_entry = if p.num_entries == 0 {
            0
        } else {
            (p.raw_key_size + p.raw_value_size) / p.num_entries
        };
        Some(Self {
            file_num,
            size: meta.size,
            smallest,
            largest,
            smallest_point: meta.smallest_point.clone(),
            largest_point: meta.largest_point.clone(),
            smallest_range_key: meta.smallest_range_key.clone(),
            largest_range_key: meta.largest_range_key.clone(),
            smallest_seq: meta.smallest_seq,
            largest_seq: meta.largest_seq,
            stats: TableStats {
                num_entries: p.num_entries,
                num_deletions: p.num_deletions,
                num_range_deletions: p.num_range_deletions,
                num_range_keys: p.num_range_keys,
                point_deletions_bytes_estimate: p.num_deletions * avg_entry,
                range_deletions_bytes_estimate: 0,
            },
            is_virtual: false,
            backing: FileBacking::new(file_num, meta.size),
            blob_references,
            blob_reference_depth,
            compacting: AtomicBool::new(false),
        })
    }

    /// Builds a file from decoded fields. Used by the manifest decoder and
    /// tests.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_num: u64,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
        smallest_seq: SeqNum,
        largest_seq: SeqNum,
        backing: Arc<FileBacking>,
        is_virtual: bool,
    ) -> Self {
        Self {
            file_num,
            size,
            smallest_point: Some(smallest.clone()),
            largest_point: Some(largest.clone()),
            smallest,
            largest,
            smallest_range_key: None,
            largest_range_key: None,
            smallest_seq,
            largest_seq,
            stats: TableStats::default(),
            is_virtual,
            backing,
            blob_references: Vec::new(),
            blob_reference_depth: 0,
            compacting: AtomicBool::new(false),
        }
    }

    /// A copy pointing at another backing object with the same number.
    pub(crate) fn with_backing(&self, backing: Arc<FileBacking>) -> Self {
        Self {
            file_num: self.file_num,
            size: self.size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            smallest_point: self.smallest_point.clone(),
            largest_point: self.largest_point.clone(),
            smallest_range_key: self.smallest_range_key.clone(),
            largest_range_key: self.largest_range_key.clone(),
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
            stats: self.stats.clone(),
            is_virtual: self.is_virtual,
            backing,
            blob_references: self.blob_references.clone(),
            blob_reference_depth: self.blob_reference_depth,
            compacting: AtomicBool::new(false),
        }
    }

    pub fn with_stats(mut self, stats: TableStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_range_deletions_estimate(mut self, bytes: u64) -> Self {
        self.stats.range_deletions_bytes_estimate = bytes;
        self
    }

    pub fn with_blob_references(mut self, refs: Vec<BlobReference>, depth: usize) -> Self {
        self.blob_references = refs;
        self.blob_reference_depth = depth;
        self
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn set_compacting(&self, on: bool) {
        self.compacting.store(on, AtomicOrdering::Release);
    }

    /// Size plus the estimated bytes its deletions would reclaim.
    pub fn compensated_size(&self) -> u64 {
        self.size
            + self.stats.point_deletions_bytes_estimate
            + self.stats.range_deletions_bytes_estimate
    }

    /// True if the file's largest bound excludes its user key.
    pub fn largest_is_exclusive(&self) -> bool {
        self.largest.is_exclusive_sentinel()
    }

    /// True if the file may hold keys in the user key range
    /// `[start, end]`.
    pub fn overlaps(&self, cmp: &Comparer, start: &[u8], end: &[u8]) -> bool {
        if cmp.cmp(end, &self.smallest.user_key) == Ordering::Less {
            return false;
        }
        match cmp.cmp(start, &self.largest.user_key) {
            Ordering::Less => true,
            Ordering::Equal => !self.largest_is_exclusive(),
            Ordering::Greater => false,
        }
    }

    /// True if the file lies entirely inside `[start, end)`.
    pub fn contained_in(&self, cmp: &Comparer, start: &[u8], end: &[u8]) -> bool {
        if cmp.cmp(&self.smallest.user_key, start) == Ordering::Less {
            return false;
        }
        match cmp.cmp(&self.largest.user_key, end) {
            Ordering::Less => true,
            Ordering::Equal => self.largest_is_exclusive(),
            Ordering::Greater => false,
        }
    }

    /// Options for iterating the file's table.
    pub fn iter_options(&self) -> TableIterOptions {
        let blob_refs: Vec<u64> = self.blob_references.iter().map(|r| r.file_num).collect();
        let (lower, upper) = if self.is_virtual {
            (Some(self.smallest.clone()), Some(self.largest.clone()))
        } else {
            (None, None)
        };
        TableIterOptions {
            blob_refs: blob_refs.into(),
            lower,
            upper,
        }
    }
}

impl fmt::Debug for FileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}:[{}-{}]", self.file_num, self.smallest, self.largest)
    }
}

impl fmt::Display for FileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:06}:[{}-{}] seqs=[{}-{}] size={}",
            self.file_num, self.smallest, self.largest, self.smallest_seq, self.largest_seq, self.size
        )?;
        if self.is_virtual {
            write!(f, " virtual({:06})", self.backing.disk_file_num)?;
        }
        if !self.blob_references.is_empty() {
            let refs: Vec<String> = self
                .blob_references
                .iter()
                .map(|r| format!("{:06}", r.file_num))
                .collect();
            write!(f, " blobs=[{}] depth={}", refs.join(","), self.blob_reference_depth)?;
        }
        Ok(())
    }
}

/// A blob file listed in a version.
pub struct BlobFileMetadata {
    pub file_num: u64,
    pub size: u64,
    /// Uncompressed bytes of all values in the file.
    pub value_size: u64,
    /// Seconds since the Unix epoch.
    pub creation_time: u64,
    pub backing: Arc<FileBacking>,
}

impl BlobFileMetadata {
    pub fn new(file_num: u64, size: u64, value_size: u64, creation_time: u64) -> Self {
        Self {
            file_num,
            size,
            value_size,
            creation_time,
            backing: FileBacking::new(file_num, size),
        }
    }
}

impl fmt::Debug for BlobFileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{:06} size={} values={}",
            self.file_num, self.size, self.value_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::{InternalKeyKind, DEFAULT_COMPARER};

    fn file(smallest: &str, largest: InternalKey) -> FileMetadata {
        FileMetadata::new(
            1,
            100,
            InternalKey::new(smallest, 1, InternalKeyKind::Set),
            largest,
            1,
            2,
            FileBacking::new(1, 100),
            false,
        )
    }

    #[test]
    fn overlap_respects_exclusive_end() {
        let cmp = &DEFAULT_COMPARER;
        let inclusive = file("c", InternalKey::new("f", 2, InternalKeyKind::Set));
        assert!(inclusive.overlaps(cmp, b"a", b"c"));
        assert!(inclusive.overlaps(cmp, b"f", b"z"));
        assert!(!inclusive.overlaps(cmp, b"a", b"b"));
        assert!(!inclusive.overlaps(cmp, b"g", b"z"));

        let exclusive = file(
            "c",
            InternalKey::exclusive_sentinel("f", InternalKeyKind::RangeDelete),
        );
        assert!(!exclusive.overlaps(cmp, b"f", b"z"));
        assert!(exclusive.overlaps(cmp, b"e", b"z"));
        assert!(exclusive.contained_in(cmp, b"c", b"f"));
        assert!(!inclusive.contained_in(cmp, b"c", b"f"));
    }

    #[test]
    fn backing_counts_references() {
        let b = FileBacking::new(4, 10);
        b.acquire();
        b.acquire();
        assert!(!b.release());
        assert_eq!(b.refs(), 1);
        assert!(b.release());
    }

    #[test]
    fn virtual_files_iterate_within_bounds() {
        let mut f = file("c", InternalKey::new("f", 2, InternalKeyKind::Set));
        assert!(f.iter_options().lower.is_none());
        f.is_virtual = true;
        f.blob_references = vec![BlobReference {
            file_num: 9,
            value_size: 10,
        }];
        let opts = f.iter_options();
        assert_eq!(opts.lower.unwrap().user_key, b"c");
        assert_eq!(&*opts.blob_refs, &[9]);
    }
}
