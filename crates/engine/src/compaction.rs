//! Compactions: the descriptor, the in-progress registry and the engine
//! entry points that pick, run and install them.
//!
//! ```text
//! pick (under the compaction mutex)
//!   └─ register: mark inputs compacting, record output range
//! execute (no locks held)
//!   ├─ Move:  edit only, the file changes level
//!   └─ else:  merge inputs ─► CompactionIter ─► OutputWriter ─► tables
//! log_and_apply(edit)
//! unregister, wake waiters
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use base::{Comparer, InternalIterator, Span};
use sstable::{MergingIter, TableReader};
use tracing::{debug, info, instrument, warn};

use crate::background::Job;
use crate::compaction_iter::{CompactionIter, ElideFn};
use crate::executor::{ExecResult, OutputWriter};
use crate::file_metadata::{BlobFileMetadata, FileMetadata};
use crate::level_iter::LevelIter;
use crate::picker::{self, ManualPick};
use crate::value_separation::{PreserveBlobReferences, ValueSeparation, WriteNewBlobFiles};
use crate::version::{Version, NUM_LEVELS};
use crate::version_edit::VersionEdit;
use crate::{EngineInner, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionKind {
    Flush,
    Default,
    Manual,
    /// A single file changes level without being rewritten.
    Move,
    /// Inputs from two levels above the output.
    MultiLevel,
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Flush => "flush",
            Self::Default => "default",
            Self::Manual => "manual",
            Self::Move => "move",
            Self::MultiLevel => "multilevel",
        };
        f.write_str(s)
    }
}

/// The files a compaction reads from one level.
#[derive(Debug, Clone)]
pub struct LevelInputs {
    pub level: usize,
    pub files: Vec<Arc<FileMetadata>>,
}

impl LevelInputs {
    pub fn new(level: usize, files: Vec<Arc<FileMetadata>>) -> Self {
        Self { level, files }
    }

    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

pub struct Compaction {
    pub id: u64,
    pub kind: CompactionKind,
    /// Start level first; the last entry is the output level.
    pub inputs: Vec<LevelInputs>,
    pub output_level: usize,
    pub grandparents: Vec<Arc<FileMetadata>>,
    /// Inclusive user key bounds of all inputs.
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub score: f64,
    pub cancel: Arc<AtomicBool>,
}

impl fmt::Debug for Compaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let levels: Vec<String> = self
            .inputs
            .iter()
            .map(|l| format!("L{}:{:?}", l.level, l.files.iter().map(|f| f.file_num).collect::<Vec<_>>()))
            .collect();
        f.debug_struct("Compaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("inputs", &levels)
            .field("output_level", &self.output_level)
            .field("score", &self.score)
            .finish()
    }
}

impl Compaction {
    pub fn start_level(&self) -> usize {
        self.inputs.first().map_or(self.output_level, |l| l.level)
    }

    pub fn input_files(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        self.inputs.iter().flat_map(|l| l.files.iter())
    }

    pub fn num_input_files(&self) -> usize {
        self.inputs.iter().map(|l| l.files.len()).sum()
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(LevelInputs::size).sum()
    }

    pub fn grandparent_bytes(&self) -> u64 {
        self.grandparents.iter().map(|f| f.size).sum()
    }

    /// Blob reference depth of the inputs: each L0 file may stack on the
    /// others, while a sorted level contributes its deepest file.
    pub fn input_blob_depth(&self) -> usize {
        self.inputs
            .iter()
            .map(|l| {
                if l.level == 0 {
                    l.files.iter().map(|f| f.blob_reference_depth).sum()
                } else {
                    l.files.iter().map(|f| f.blob_reference_depth).max().unwrap_or(0)
                }
            })
            .sum()
    }

    fn overlaps_range(&self, cmp: &Comparer, smallest: &[u8], largest: &[u8]) -> bool {
        cmp.cmp(&self.smallest, largest) != std::cmp::Ordering::Greater
            && cmp.cmp(smallest, &self.largest) != std::cmp::Ordering::Greater
    }
}

/// What the registry remembers about a running compaction.
#[derive(Debug)]
struct InProgress {
    output_level: usize,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionMetrics {
    pub count: BTreeMap<String, u64>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub blob_bytes_referenced: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Compactions in flight plus picker state. Guarded by the engine's
/// compaction mutex.
#[derive(Debug, Default)]
pub struct CompactionState {
    in_progress: BTreeMap<u64, InProgress>,
    next_id: u64,
    /// Largest user key of the last compaction started from each level.
    pointers: [Option<Vec<u8>>; NUM_LEVELS],
    pub metrics: CompactionMetrics,
}

impl CompactionState {
    pub fn num_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    pub fn pointer(&self, level: usize) -> Option<&[u8]> {
        self.pointers[level].as_deref()
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// True if `c` would collide with a compaction already running.
    pub fn conflicts(&self, cmp: &Comparer, c: &Compaction) -> bool {
        if c.input_files().any(|f| f.is_compacting()) {
            return true;
        }
        self.in_progress.values().any(|p| {
            p.output_level == c.output_level && c.overlaps_range(cmp, &p.smallest, &p.largest)
        })
    }

    pub(crate) fn register(&mut self, c: &Compaction) {
        for f in c.input_files() {
            f.set_compacting(true);
        }
        if c.kind != CompactionKind::Flush {
            self.pointers[c.start_level()] = Some(c.largest.clone());
        }
        self.in_progress.insert(
            c.id,
            InProgress {
                output_level: c.output_level,
                smallest: c.smallest.clone(),
                largest: c.largest.clone(),
                cancel: Arc::clone(&c.cancel),
            },
        );
    }

    pub(crate) fn unregister(&mut self, c: &Compaction) {
        for f in c.input_files() {
            f.set_compacting(false);
        }
        self.in_progress.remove(&c.id);
    }

    pub(crate) fn cancel_all(&self) {
        for p in self.in_progress.values() {
            p.cancel.store(true, AtomicOrdering::Release);
        }
    }
}

/// Range deletions and range keys of one table, clipped to the file's
/// bounds when the file is virtual.
pub(crate) fn file_spans(cmp: &Comparer, reader: &TableReader, file: &FileMetadata) -> (Vec<Span>, Vec<Span>) {
    let clip = |spans: &[Span]| -> Vec<Span> {
        if !file.is_virtual {
            return spans.to_vec();
        }
        let lo = file.smallest.user_key.as_slice();
        let hi = file.largest.user_key.as_slice();
        spans
            .iter()
            .filter_map(|s| {
                let start = cmp.max(&s.start, lo).to_vec();
                // an inclusive upper bound keeps the span through `hi`
                let end = if file.largest_is_exclusive() {
                    cmp.min(&s.end, hi).to_vec()
                } else {
                    s.end.clone()
                };
                (cmp.cmp(&start, &end) == std::cmp::Ordering::Less).then(|| Span {
                    start,
                    end,
                    keys: s.keys.clone(),
                })
            })
            .collect()
    };
    (clip(reader.range_dels()), clip(reader.range_keys()))
}

/// Keys of `spans` in a form suitable for logging.
fn span_count(spans: &[Span]) -> usize {
    spans.iter().map(|s| s.keys.len()).sum()
}

impl EngineInner {
    /// Picks and runs compactions until none is needed or every candidate
    /// conflicts with one already running.
    #[instrument(skip(self))]
    pub(crate) fn maybe_compact(&self) -> Result<()> {
        if self.opts.disable_automatic_compactions {
            return Ok(());
        }
        loop {
            self.check_writable()?;
            let picked = {
                let mut st = self.compactions.lock();
                let version = self.versions.current();
                picker::pick_auto(&version, &self.opts, &mut st)
            };
            let Some(c) = picked else {
                return Ok(());
            };
            if self.compactions.lock().num_in_progress() < self.opts.max_concurrent_compactions {
                self.schedule(Job::MaybeCompact);
            }
            self.run_compaction(c)?;
        }
    }

    /// Runs automatic compactions on the calling thread until the tree
    /// needs none, waiting out compactions that block a pick.
    pub(crate) fn compact_until_settled(&self) -> Result<()> {
        loop {
            self.check_writable()?;
            let picked = {
                let mut st = self.compactions.lock();
                loop {
                    let version = self.versions.current();
                    if let Some(c) = picker::pick_auto(&version, &self.opts, &mut st) {
                        break Some(c);
                    }
                    if st.num_in_progress() == 0 {
                        break None;
                    }
                    self.compaction_done.wait(&mut st);
                }
            };
            match picked {
                Some(c) => self.run_compaction(c)?,
                None => return Ok(()),
            }
        }
    }

    /// Compacts every file overlapping `[start, end]` down to the deepest
    /// level holding data in that range.
    pub(crate) fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let cmp = self.opts.comparer;
        if cmp.cmp(start, end) == std::cmp::Ordering::Greater {
            return Err(base::invalid_argument("compaction range start is after end"));
        }
        let version = self.versions.current();
        let Some(bottom) = (0..NUM_LEVELS)
            .rev()
            .find(|&l| !version.overlapping(l, start, end).is_empty())
        else {
            return Ok(());
        };
        drop(version);
        let last = bottom.max(1).min(NUM_LEVELS - 1);
        for level in 0..last {
            loop {
                self.check_writable()?;
                let pick = {
                    let mut st = self.compactions.lock();
                    let version = self.versions.current();
                    let pick = picker::pick_manual(&version, &self.opts, &mut st, level, start, end);
                    if matches!(pick, ManualPick::Conflict) {
                        self.compaction_done.wait(&mut st);
                    }
                    pick
                };
                match pick {
                    ManualPick::Picked(c) => {
                        self.run_compaction(c)?;
                        break;
                    }
                    ManualPick::Nothing => break,
                    ManualPick::Conflict => continue,
                }
            }
        }
        Ok(())
    }

    /// Executes a registered compaction and unregisters it.
    pub(crate) fn run_compaction(&self, c: Compaction) -> Result<()> {
        self.emit(Event::CompactionBegin {
            id: c.id,
            kind: c.kind,
            start_level: c.start_level(),
            output_level: c.output_level,
        });
        let started = Instant::now();
        let res = self.execute(&c);
        {
            let mut st = self.compactions.lock();
            st.unregister(&c);
            match &res {
                Ok(r) => {
                    *st.metrics.count.entry(c.kind.to_string()).or_insert(0) += 1;
                    st.metrics.bytes_read += c.input_bytes();
                    st.metrics.bytes_written += r.bytes_written;
                    st.metrics.blob_bytes_referenced += r.blob_reference_bytes;
                }
                Err(e) if matches!(base::classify(e), Some(base::Error::Cancelled)) => {
                    st.metrics.cancelled += 1;
                }
                Err(_) => st.metrics.failed += 1,
            }
        }
        self.compaction_done.notify_all();

        match &res {
            Ok(r) => {
                info!(
                    job = c.id,
                    kind = %c.kind,
                    from = c.start_level(),
                    to = c.output_level,
                    inputs = c.num_input_files(),
                    outputs = r.tables.len(),
                    bytes_in = c.input_bytes(),
                    bytes_out = r.bytes_written,
                    blob_refs = r.blob_reference_bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "compaction finished"
                );
                self.emit(Event::CompactionEnd {
                    id: c.id,
                    kind: c.kind,
                    output_level: c.output_level,
                    outputs: r.tables.len(),
                });
            }
            Err(e) => warn!(job = c.id, kind = %c.kind, error = %e, "compaction aborted"),
        }
        res.map(|_| ())
    }

    fn execute(&self, c: &Compaction) -> Result<ExecResult> {
        if c.kind == CompactionKind::Move {
            let mut edit = VersionEdit::default();
            for l in &c.inputs {
                for f in &l.files {
                    edit.delete_file(l.level, f.file_num);
                    edit.add_file(c.output_level, Arc::clone(f));
                }
            }
            self.versions.log_and_apply(edit)?;
            return Ok(ExecResult::default());
        }

        let version = self.versions.current();
        let cmp = self.opts.comparer;
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        let mut range_dels = Vec::new();
        let mut range_keys = Vec::new();
        for l in &c.inputs {
            for f in &l.files {
                let reader = self.cache.table(f)?;
                let (rd, rk) = file_spans(cmp, &reader, f);
                range_dels.extend(rd);
                range_keys.extend(rk);
                if l.level == 0 {
                    children.push(Box::new(reader.iter(f.iter_options())));
                }
            }
            if l.level > 0 && !l.files.is_empty() {
                children.push(Box::new(LevelIter::new(cmp, Arc::clone(&self.cache), l.files.clone())));
            }
        }
        debug!(
            job = c.id,
            children = children.len(),
            range_dels = span_count(&range_dels),
            range_keys = span_count(&range_keys),
            "compaction inputs opened"
        );

        let below = Arc::clone(&version);
        let output_level = c.output_level;
        let elide: ElideFn = Box::new(move |s, e| !below.overlaps_below(output_level + 1, s, e));
        let iter = CompactionIter::new(
            cmp,
            self.opts.merger,
            Arc::clone(&self.cache) as Arc<dyn base::ValueFetcher>,
            Box::new(MergingIter::new(cmp, children)),
            self.snapshots.to_vec(),
            range_dels,
            range_keys,
            elide,
        );

        let policy = self.compaction_policy(c, &version);
        let lower: Vec<Arc<FileMetadata>> = (c.output_level + 1..NUM_LEVELS)
            .flat_map(|l| version.overlapping(l, &c.smallest, &c.largest))
            .collect();
        let writer = OutputWriter::new(
            &self.opts,
            Arc::clone(&self.store),
            self.versions.file_numbers(),
            policy,
            &c.grandparents,
            lower,
            Some(Arc::clone(&c.cancel)),
        );
        let result = writer.run(iter)?;

        let mut edit = VersionEdit::default();
        for l in &c.inputs {
            for f in &l.files {
                edit.delete_file(l.level, f.file_num);
            }
        }
        for t in &result.tables {
            edit.add_file(c.output_level, Arc::clone(t));
        }
        edit.new_blob_files = result.blob_files.clone();
        if let Err(e) = self.versions.log_and_apply(edit) {
            result.remove_outputs(self.store.as_ref());
            return Err(e);
        }
        Ok(result)
    }

    /// Compactions keep existing blob references unless the inputs stack
    /// up more blob files than allowed, in which case values are rewritten.
    fn compaction_policy(&self, c: &Compaction, version: &Version) -> ValueSeparation {
        let depth = c.input_blob_depth();
        let vs = &self.opts.value_separation;
        if vs.enabled && depth > vs.max_blob_reference_depth {
            debug!(job = c.id, depth, "rewriting blob references");
            return ValueSeparation::WriteNewBlobFiles(WriteNewBlobFiles::new(
                &self.opts,
                Arc::clone(&self.cache) as Arc<dyn base::ValueFetcher>,
                self.blob_object_factory(),
            ));
        }
        let referenced: BTreeSet<u64> = c
            .input_files()
            .flat_map(|f| f.blob_references.iter().map(|r| r.file_num))
            .collect();
        let inputs: BTreeMap<u64, Arc<BlobFileMetadata>> = referenced
            .into_iter()
            .filter_map(|n| version.blob_file(n).map(|b| (n, Arc::clone(b))))
            .collect();
        ValueSeparation::PreserveBlobReferences(PreserveBlobReferences::new(inputs, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_metadata::FileBacking;
    use base::{InternalKey, InternalKeyKind, DEFAULT_COMPARER};

    fn file(num: u64, lo: &str, hi: &str) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            num,
            100,
            InternalKey::new(lo.as_bytes().to_vec(), 1, InternalKeyKind::Set),
            InternalKey::new(hi.as_bytes().to_vec(), 1, InternalKeyKind::Set),
            1,
            1,
            FileBacking::new(num, 100),
            false,
        ))
    }

    fn compaction(id: u64, level: usize, files: Vec<Arc<FileMetadata>>, lo: &str, hi: &str) -> Compaction {
        Compaction {
            id,
            kind: CompactionKind::Default,
            inputs: vec![LevelInputs::new(level, files), LevelInputs::new(level + 1, Vec::new())],
            output_level: level + 1,
            grandparents: Vec::new(),
            smallest: lo.as_bytes().to_vec(),
            largest: hi.as_bytes().to_vec(),
            score: 1.0,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn registered_inputs_are_marked_compacting() {
        let mut st = CompactionState::default();
        let f = file(1, "a", "c");
        let c = compaction(1, 1, vec![Arc::clone(&f)], "a", "c");
        assert!(!st.conflicts(&DEFAULT_COMPARER, &c));
        st.register(&c);
        assert!(f.is_compacting());
        assert_eq!(st.pointer(1), Some(&b"c"[..]));
        // the same file cannot be picked twice
        assert!(st.conflicts(&DEFAULT_COMPARER, &compaction(2, 1, vec![Arc::clone(&f)], "a", "c")));
        st.unregister(&c);
        assert!(!f.is_compacting());
        assert_eq!(st.num_in_progress(), 0);
    }

    #[test]
    fn overlapping_output_ranges_conflict() {
        let mut st = CompactionState::default();
        st.register(&compaction(1, 1, vec![file(1, "a", "f")], "a", "f"));
        assert!(st.conflicts(&DEFAULT_COMPARER, &compaction(2, 1, vec![file(2, "f", "k")], "f", "k")));
        assert!(!st.conflicts(&DEFAULT_COMPARER, &compaction(3, 1, vec![file(3, "g", "k")], "g", "k")));
        // a different output level never conflicts by range
        assert!(!st.conflicts(&DEFAULT_COMPARER, &compaction(4, 2, vec![file(4, "a", "f")], "a", "f")));
    }

    #[test]
    fn cancel_all_sets_every_flag() {
        let mut st = CompactionState::default();
        let a = compaction(1, 1, vec![file(1, "a", "b")], "a", "b");
        let b = compaction(2, 3, vec![file(2, "c", "d")], "c", "d");
        st.register(&a);
        st.register(&b);
        st.cancel_all();
        assert!(a.cancel.load(AtomicOrdering::Acquire));
        assert!(b.cancel.load(AtomicOrdering::Acquire));
    }

    #[test]
    fn blob_depth_sums_l0_and_maxes_levels() {
        let mut deep = FileMetadata::new(
            1,
            1,
            InternalKey::new(b"a".to_vec(), 1, InternalKeyKind::Set),
            InternalKey::new(b"b".to_vec(), 1, InternalKeyKind::Set),
            1,
            1,
            FileBacking::new(1, 1),
            false,
        );
        deep.blob_reference_depth = 2;
        let deep = Arc::new(deep);
        let mut c = compaction(1, 0, vec![Arc::clone(&deep), Arc::clone(&deep)], "a", "b");
        c.inputs[1].files = vec![Arc::clone(&deep), file(9, "c", "d")];
        assert_eq!(c.input_blob_depth(), 2 + 2 + 2);
    }
}
