//! Immutable versions of the LSM structure.
//!
//! ```text
//! L0   [f9 seq 40-52] [f12 seq 53-60]    overlapping, ordered by seq
//! L1   [a..f] [g..m] [n..z]              sorted, non-overlapping
//! ...
//! L6
//! blob files: {B7, B10}
//! ```
//!
//! A version never changes after it is built. Building one acquires a
//! reference on every file backing it lists; dropping it releases them,
//! and a backing whose last reference goes away is handed to the cleanup
//! thread for deletion.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use base::{invariant, Comparer};
use crossbeam_channel::Sender;
use tracing::debug;

use crate::background::CleanupJob;
use crate::file_metadata::{BlobFileMetadata, FileMetadata};
use crate::filenames::FileType;
use crate::version_edit::{BulkVersionEdit, VersionEdit, VersionParts};

pub const NUM_LEVELS: usize = 7;

pub struct Version {
    levels: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    blob_files: BTreeMap<u64, Arc<BlobFileMetadata>>,
    cmp: &'static Comparer,
    /// WALs numbered below this are fully reflected in the tables.
    log_number: u64,
    obsolete: Option<Sender<CleanupJob>>,
}

impl Version {
    pub fn empty(cmp: &'static Comparer) -> Self {
        Self {
            levels: Default::default(),
            blob_files: BTreeMap::new(),
            cmp,
            log_number: 0,
            obsolete: None,
        }
    }

    /// Builds a version and takes a reference on every backing it lists.
    pub fn from_parts(
        parts: VersionParts,
        cmp: &'static Comparer,
        obsolete: Option<Sender<CleanupJob>>,
    ) -> Self {
        for f in parts.levels.iter().flatten() {
            f.backing.acquire();
        }
        for b in parts.blob_files.values() {
            b.backing.acquire();
        }
        Self {
            levels: parts.levels,
            blob_files: parts.blob_files,
            cmp,
            log_number: 0,
            obsolete,
        }
    }

    pub fn with_log_number(mut self, log_number: u64) -> Self {
        self.log_number = log_number;
        self
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// File lists of this version with `edit` applied.
    pub fn apply(&self, edit: &VersionEdit) -> Result<VersionParts> {
        let mut bulk = BulkVersionEdit::new();
        bulk.accumulate(edit)?;
        bulk.apply(self, self.cmp)
    }

    pub fn comparer(&self) -> &'static Comparer {
        self.cmp
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.levels[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn total_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0 && self.blob_files.is_empty()
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|f| f.size).sum()
    }

    pub fn blob_files(&self) -> &BTreeMap<u64, Arc<BlobFileMetadata>> {
        &self.blob_files
    }

    pub fn blob_file(&self, num: u64) -> Option<&Arc<BlobFileMetadata>> {
        self.blob_files.get(&num)
    }

    /// Files of `level` that may hold keys in the user key range
    /// `[start, end]`. In level 0 the range grows to cover every file that
    /// overlaps a file already picked, since L0 files overlap each other.
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<FileMetadata>> {
        let cmp = self.cmp;
        let files = &self.levels[level];
        if level > 0 {
            return files
                .iter()
                .filter(|f| f.overlaps(cmp, start, end))
                .cloned()
                .collect();
        }
        let mut lo = start.to_vec();
        let mut hi = end.to_vec();
        loop {
            let picked: Vec<Arc<FileMetadata>> = files
                .iter()
                .filter(|f| f.overlaps(cmp, &lo, &hi))
                .cloned()
                .collect();
            let mut grew = false;
            for f in &picked {
                if cmp.cmp(&f.smallest.user_key, &lo) == Ordering::Less {
                    lo = f.smallest.user_key.clone();
                    grew = true;
                }
                if cmp.cmp(&f.largest.user_key, &hi) == Ordering::Greater {
                    hi = f.largest.user_key.clone();
                    grew = true;
                }
            }
            if !grew {
                return picked;
            }
        }
    }

    /// True if any file at a level `>= from_level` may hold keys in the
    /// user key range `[start, end]`.
    pub fn overlaps_below(&self, from_level: usize, start: &[u8], end: &[u8]) -> bool {
        (from_level..NUM_LEVELS).any(|level| {
            self.levels[level]
                .iter()
                .any(|f| f.overlaps(self.cmp, start, end))
        })
    }

    /// Verifies that every file is internally bounded and that levels 1
    /// and up are sorted and non-overlapping.
    pub fn check_ordering(&self) -> Result<()> {
        let cmp = self.cmp;
        for (level, files) in self.levels.iter().enumerate() {
            for f in files {
                if cmp.cmp_internal(&f.smallest, &f.largest) == Ordering::Greater {
                    return Err(invariant(format!(
                        "L{} file {:?} has inverted bounds",
                        level, f
                    )));
                }
            }
            if level == 0 {
                for pair in files.windows(2) {
                    if pair[0].largest_seq > pair[1].largest_seq {
                        return Err(invariant(format!(
                            "L0 files out of sequence order: {:?} {:?}",
                            pair[0], pair[1]
                        )));
                    }
                }
                continue;
            }
            for pair in files.windows(2) {
                if cmp.cmp_internal(&pair[0].largest, &pair[1].smallest) != Ordering::Less {
                    return Err(invariant(format!(
                        "L{} files overlap: {:?} {:?}",
                        level, pair[0], pair[1]
                    )));
                }
            }
        }
        Ok(())
    }

    /// An edit that rebuilds this version from nothing. Written at the
    /// start of every manifest.
    pub fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::default();
        for (level, files) in self.levels.iter().enumerate() {
            for f in files {
                edit.add_file(level, Arc::clone(f));
            }
        }
        edit.new_blob_files = self.blob_files.values().cloned().collect();
        edit
    }
}

impl Drop for Version {
    fn drop(&mut self) {
        let mut released = Vec::new();
        for f in self.levels.iter().flatten() {
            if f.backing.release() {
                released.push((FileType::Table, f.backing.disk_file_num));
            }
        }
        for b in self.blob_files.values() {
            if b.backing.release() {
                released.push((FileType::Blob, b.file_num));
            }
        }
        if let Some(tx) = &self.obsolete {
            for (file_type, num) in released {
                debug!(file_num = num, ?file_type, "file is obsolete");
                // The receiver is gone only after shutdown; leftovers are
                // collected on the next open.
                let _ = tx.send(CleanupJob::Obsolete(file_type, num));
            }
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Renders the level structure, one file per line.
impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "(empty)");
        }
        for (level, files) in self.levels.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            writeln!(f, "L{}:", level)?;
            for file in files {
                writeln!(f, "  {}", file)?;
            }
        }
        if !self.blob_files.is_empty() {
            writeln!(f, "blob files:")?;
            for b in self.blob_files.values() {
                writeln!(f, "  {:?}", b)?;
            }
        }
        Ok(())
    }
}
