//! Writes the survivors of a [`CompactionIter`] into new tables.
//!
//! Outputs are cut when the current table (plus the blob bytes it
//! references) reaches `target_file_size`, or when it overlaps too much of
//! the grandparent level. A cut never lands strictly inside a range
//! deletion or range key span, so every span ends up whole in exactly one
//! output:
//!
//! ```text
//! keys:    a   b   c   d   e   f
//! spans:       [b ----- e)
//! cut ok:  ^   ^               ^     (before a key a span does not cover)
//! ```

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Result;
use base::keyspan::find_containing;
use base::{Comparer, Span};
use config::Options;
use sstable::{ObjectStore, TableWriter, WriterOptions};
use tracing::{debug, warn};

use crate::compaction_iter::{CompactionIter, CompactionIterStats};
use crate::file_metadata::{BlobFileMetadata, FileMetadata};
use crate::filenames::{blob_name, table_name};
use crate::value_separation::{ValueSeparation, ValueSeparationPolicy};

/// The files a flush or compaction produced.
#[derive(Debug, Default)]
pub struct ExecResult {
    pub tables: Vec<Arc<FileMetadata>>,
    pub blob_files: Vec<Arc<BlobFileMetadata>>,
    pub bytes_written: u64,
    /// Value bytes the output tables reference in blob files.
    pub blob_reference_bytes: u64,
    pub stats: CompactionIterStats,
}

impl ExecResult {
    /// Best-effort removal of every output, for when the edit installing
    /// them could not be applied.
    pub fn remove_outputs(&self, store: &dyn ObjectStore) {
        let names = self
            .tables
            .iter()
            .map(|t| table_name(t.file_num))
            .chain(self.blob_files.iter().map(|b| blob_name(b.file_num)));
        for name in names {
            if let Err(e) = store.remove(&name) {
                warn!(object = %name, error = %e, "failed to remove compaction output");
            }
        }
    }
}

/// Tracks how much of the grandparent level the current output overlaps.
struct GrandparentOverlap<'a> {
    files: &'a [Arc<FileMetadata>],
    index: usize,
    overlapped: u64,
    seen_key: bool,
}

impl GrandparentOverlap<'_> {
    /// True when the output should end before `key`.
    fn should_stop_before(&mut self, cmp: &Comparer, key: &[u8], limit: u64) -> bool {
        while self.index < self.files.len()
            && cmp.cmp(key, &self.files[self.index].largest.user_key) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped += self.files[self.index].size;
            }
            self.index += 1;
        }
        self.seen_key = true;
        if self.overlapped > limit {
            self.overlapped = 0;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.overlapped = 0;
    }
}

pub struct OutputWriter<'a> {
    opts: &'a Options,
    cmp: &'static Comparer,
    store: Arc<dyn ObjectStore>,
    file_nums: Arc<AtomicU64>,
    policy: ValueSeparation,
    grandparents: GrandparentOverlap<'a>,
    /// Files below the output level, for range deletion estimates.
    lower: Vec<Arc<FileMetadata>>,
    cancel: Option<Arc<AtomicBool>>,
    split: bool,
    current: Option<(u64, TableWriter)>,
    /// Range deletions written to the current output.
    current_range_dels: Vec<(Vec<u8>, Vec<u8>)>,
    result: ExecResult,
}

impl<'a> OutputWriter<'a> {
    pub fn new(
        opts: &'a Options,
        store: Arc<dyn ObjectStore>,
        file_nums: Arc<AtomicU64>,
        policy: ValueSeparation,
        grandparents: &'a [Arc<FileMetadata>],
        lower: Vec<Arc<FileMetadata>>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            opts,
            cmp: opts.comparer,
            store,
            file_nums,
            policy,
            grandparents: GrandparentOverlap {
                files: grandparents,
                index: 0,
                overlapped: 0,
                seen_key: false,
            },
            lower,
            cancel,
            split: true,
            current: None,
            current_range_dels: Vec::new(),
            result: ExecResult::default(),
        }
    }

    /// Writes everything into a single output. Flushes use this.
    pub fn without_splitting(mut self) -> Self {
        self.split = false;
        self
    }

    /// Drains `iter` into output tables.
    ///
    /// # Errors
    ///
    /// On any failure every output written so far is aborted or removed.
    pub fn run(mut self, mut iter: CompactionIter) -> Result<ExecResult> {
        match self.write_all(&mut iter) {
            Ok(()) => {
                self.result.stats = iter.stats();
                Ok(self.result)
            }
            Err(e) => {
                if let Some((_, w)) = self.current.take() {
                    w.abort();
                }
                self.policy.abort();
                self.result.remove_outputs(self.store.as_ref());
                Err(e)
            }
        }
    }

    fn write_all(&mut self, iter: &mut CompactionIter) -> Result<()> {
        let range_dels = iter.range_dels().to_vec();
        let range_keys = iter.range_keys().to_vec();
        let (mut next_del, mut next_rk) = (0, 0);

        while let Some(kvs) = iter.next_user_key()? {
            if self.cancel.as_ref().is_some_and(|c| c.load(AtomicOrdering::Acquire)) {
                return Err(base::Error::Cancelled.into());
            }
            let Some(first) = kvs.first() else {
                continue;
            };
            let user_key = first.key.user_key.clone();

            if self.current.is_some()
                && self.should_roll(&user_key)
                && !strictly_inside(self.cmp, &range_dels, &user_key)
                && !strictly_inside(self.cmp, &range_keys, &user_key)
            {
                self.add_spans(&range_dels, &mut next_del, &range_keys, &mut next_rk, &user_key, false)?;
                self.finish_output()?;
            }
            self.add_spans(&range_dels, &mut next_del, &range_keys, &mut next_rk, &user_key, true)?;
            self.ensure_output()?;
            let Some((_, writer)) = self.current.as_mut() else {
                return Err(base::invariant("output writer missing"));
            };
            for kv in &kvs {
                self.policy.add(writer, kv)?;
            }
        }

        if next_del < range_dels.len() || next_rk < range_keys.len() {
            self.ensure_output()?;
            for span in &range_dels[next_del..] {
                self.add_range_del(span)?;
            }
            for span in &range_keys[next_rk..] {
                self.add_range_key(span)?;
            }
        }
        self.finish_output()
    }

    fn should_roll(&mut self, user_key: &[u8]) -> bool {
        let limit = self.opts.max_grandparent_overlap_factor * self.opts.target_file_size;
        let overlap = self.grandparents.should_stop_before(self.cmp, user_key, limit);
        if !self.split {
            return false;
        }
        let size = self
            .current
            .as_ref()
            .map_or(0, |(_, w)| w.estimated_size())
            + self.policy.estimated_reference_size();
        overlap || size >= self.opts.target_file_size
    }

    /// Writes the pending spans that start before `key` (or at it, when
    /// `inclusive`) into the current output.
    fn add_spans(
        &mut self,
        range_dels: &[Span],
        next_del: &mut usize,
        range_keys: &[Span],
        next_rk: &mut usize,
        key: &[u8],
        inclusive: bool,
    ) -> Result<()> {
        let cmp = self.cmp;
        let due = |s: &Span| match cmp.cmp(&s.start, key) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        };
        while *next_del < range_dels.len() && due(&range_dels[*next_del]) {
            self.ensure_output()?;
            self.add_range_del(&range_dels[*next_del])?;
            *next_del += 1;
        }
        while *next_rk < range_keys.len() && due(&range_keys[*next_rk]) {
            self.ensure_output()?;
            self.add_range_key(&range_keys[*next_rk])?;
            *next_rk += 1;
        }
        Ok(())
    }

    fn add_range_del(&mut self, span: &Span) -> Result<()> {
        let (_, writer) = self.ensure_output()?;
        writer.add_range_del(span)?;
        self.current_range_dels.push((span.start.clone(), span.end.clone()));
        Ok(())
    }

    fn add_range_key(&mut self, span: &Span) -> Result<()> {
        let (_, writer) = self.ensure_output()?;
        writer.add_range_key(span)
    }

    fn ensure_output(&mut self) -> Result<&mut (u64, TableWriter)> {
        if self.current.is_none() {
            let num = self.file_nums.fetch_add(1, AtomicOrdering::AcqRel);
            let out = self.store.create(&table_name(num))?;
            let writer = TableWriter::new(
                out,
                WriterOptions::new(self.cmp, self.opts.block_size)
                    .with_bloom_bits(self.opts.bloom_bits_per_key),
            );
            self.grandparents.reset();
            self.current_range_dels.clear();
            debug!(file_num = num, "started output table");
            self.current = Some((num, writer));
        }
        match self.current.as_mut() {
            Some(cur) => Ok(cur),
            None => Err(base::invariant("output writer missing")),
        }
    }

    fn finish_output(&mut self) -> Result<()> {
        let Some((num, writer)) = self.current.take() else {
            return Ok(());
        };
        let vs = self.policy.finish_output()?;
        self.result.blob_reference_bytes += vs.reference_size;
        if let Some(blob) = vs.new_blob_file {
            self.result.bytes_written += blob.size;
            self.result.blob_files.push(Arc::new(blob));
        }
        let meta = writer.finish()?;
        self.result.bytes_written += meta.size;
        let Some(file) =
            FileMetadata::from_writer(num, &meta, self.cmp, vs.blob_references, vs.reference_depth)
        else {
            // nothing was written; the object is an empty table
            self.store.remove(&table_name(num))?;
            return Ok(());
        };
        let estimate = self.range_deletion_estimate();
        debug!(
            file_num = num,
            size = meta.size,
            smallest = %file.smallest,
            largest = %file.largest,
            blob_refs = vs.reference_size,
            "finished output table"
        );
        self.result
            .tables
            .push(Arc::new(file.with_range_deletions_estimate(estimate)));
        Ok(())
    }

    /// Bytes of lower-level files lying entirely under the current
    /// output's range deletions.
    fn range_deletion_estimate(&self) -> u64 {
        let mut counted = BTreeSet::new();
        let mut total = 0;
        for (start, end) in &self.current_range_dels {
            for f in &self.lower {
                if f.contained_in(self.cmp, start, end) && counted.insert(f.file_num) {
                    total += f.size;
                }
            }
        }
        total
    }
}

/// True if `key` falls inside a span of `spans` without being its start.
fn strictly_inside(cmp: &Comparer, spans: &[Span], key: &[u8]) -> bool {
    find_containing(cmp, spans, key).is_some_and(|i| cmp.cmp(&spans[i].start, key) == Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction_iter::ElideFn;
    use crate::file_cache::FileCache;
    use crate::value_separation::PreserveBlobReferences;
    use base::{InternalIterator, InternalKey, InternalKeyKind, InternalKv, SpanKey, DEFAULT_COMPARER, DEFAULT_MERGER};
    use sstable::{FsObjectStore, MergingIter, TableIterOptions};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct VecIter {
        kvs: Vec<InternalKv>,
        pos: Option<usize>,
    }

    impl InternalIterator for VecIter {
        fn first(&mut self) -> Result<()> {
            self.pos = (!self.kvs.is_empty()).then_some(0);
            Ok(())
        }
        fn last(&mut self) -> Result<()> {
            self.pos = self.kvs.len().checked_sub(1);
            Ok(())
        }
        fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
            let i = self.kvs.partition_point(|kv| kv.key.user_key.as_slice() < key);
            self.pos = (i < self.kvs.len()).then_some(i);
            Ok(())
        }
        fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
            let i = self.kvs.partition_point(|kv| kv.key.user_key.as_slice() < key);
            self.pos = i.checked_sub(1);
            Ok(())
        }
        fn next(&mut self) -> Result<()> {
            self.pos = self.pos.map(|p| p + 1).filter(|&p| p < self.kvs.len());
            Ok(())
        }
        fn prev(&mut self) -> Result<()> {
            self.pos = self.pos.and_then(|p| p.checked_sub(1));
            Ok(())
        }
        fn current(&self) -> Option<&InternalKv> {
            self.pos.map(|p| &self.kvs[p])
        }
    }

    fn setup(dir: &std::path::Path) -> anyhow::Result<(Arc<dyn ObjectStore>, Arc<FileCache>)> {
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::open(dir)?);
        let cache = Arc::new(FileCache::new(Arc::clone(&store), &DEFAULT_COMPARER, 16));
        Ok((store, cache))
    }

    fn compaction_iter(cache: &Arc<FileCache>, kvs: Vec<InternalKv>, range_dels: Vec<Span>) -> CompactionIter {
        let elide: ElideFn = Box::new(|_, _| false);
        CompactionIter::new(
            &DEFAULT_COMPARER,
            &DEFAULT_MERGER,
            Arc::clone(cache) as Arc<dyn base::ValueFetcher>,
            Box::new(MergingIter::new(
                &DEFAULT_COMPARER,
                vec![Box::new(VecIter { kvs, pos: None })],
            )),
            Vec::new(),
            range_dels,
            Vec::new(),
            elide,
        )
    }

    fn kvs(n: usize, value_len: usize) -> Vec<InternalKv> {
        (0..n)
            .map(|i| {
                InternalKv::inline(
                    InternalKey::new(format!("key{:04}", i), 100 + i as u64, InternalKeyKind::Set),
                    vec![b'v'; value_len],
                )
            })
            .collect()
    }

    fn preserve() -> ValueSeparation {
        ValueSeparation::PreserveBlobReferences(PreserveBlobReferences::new(BTreeMap::new(), 0))
    }

    fn small_opts() -> Options {
        Options {
            target_file_size: 4096,
            block_size: 512,
            ..Options::default()
        }
    }

    // ---- Splitting ----

    #[test]
    fn outputs_roll_at_target_size() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        let nums = Arc::new(AtomicU64::new(10));
        let writer = OutputWriter::new(&opts, Arc::clone(&store), nums, preserve(), &[], Vec::new(), None);
        let res = writer.run(compaction_iter(&cache, kvs(200, 100), Vec::new()))?;

        assert!(res.tables.len() > 1, "expected several outputs, got {}", res.tables.len());
        for pair in res.tables.windows(2) {
            assert_eq!(
                DEFAULT_COMPARER.cmp(&pair[0].largest.user_key, &pair[1].smallest.user_key),
                Ordering::Less
            );
        }
        let total: u64 = res.tables.iter().map(|t| t.stats.num_entries).sum();
        assert_eq!(total, 200);
        assert_eq!(res.stats.keys_out, 200);
        Ok(())
    }

    #[test]
    fn flush_writes_a_single_output() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        let writer = OutputWriter::new(&opts, store, Arc::new(AtomicU64::new(1)), preserve(), &[], Vec::new(), None)
            .without_splitting();
        let res = writer.run(compaction_iter(&cache, kvs(200, 100), Vec::new()))?;
        assert_eq!(res.tables.len(), 1);
        assert_eq!(res.tables[0].file_num, 1);
        Ok(())
    }

    #[test]
    fn range_deletion_is_not_split() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        // a tombstone older than every point covering most of the keys
        let del = Span::new(
            "key0010",
            "key0190",
            vec![SpanKey::new(base::make_trailer(1, InternalKeyKind::RangeDelete), "", "")],
        );
        let writer = OutputWriter::new(&opts, store, Arc::new(AtomicU64::new(1)), preserve(), &[], Vec::new(), None);
        let res = writer.run(compaction_iter(&cache, kvs(200, 100), vec![del]))?;

        let holders: Vec<&Arc<FileMetadata>> = res
            .tables
            .iter()
            .filter(|t| t.stats.num_range_deletions > 0)
            .collect();
        assert_eq!(holders.len(), 1);
        let t = holders[0];
        assert!(DEFAULT_COMPARER.cmp(&t.smallest.user_key, b"key0010") != Ordering::Greater);
        assert!(DEFAULT_COMPARER.cmp(&t.largest.user_key, b"key0190") != Ordering::Less);
        Ok(())
    }

    #[test]
    fn trailing_spans_get_written() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        let del = Span::new(
            "x",
            "z",
            vec![SpanKey::new(base::make_trailer(5, InternalKeyKind::RangeDelete), "", "")],
        );
        let writer = OutputWriter::new(&opts, store, Arc::new(AtomicU64::new(1)), preserve(), &[], Vec::new(), None);
        let res = writer.run(compaction_iter(&cache, kvs(3, 10), vec![del]))?;
        assert_eq!(res.tables.len(), 1);
        let t = &res.tables[0];
        assert_eq!(t.largest.user_key, b"z");
        assert!(t.largest_is_exclusive());

        let reader = cache.table(t)?;
        assert_eq!(reader.range_dels().len(), 1);
        let mut it = reader.iter(TableIterOptions::default());
        it.first()?;
        assert!(it.current().is_some());
        Ok(())
    }

    #[test]
    fn cancelled_run_removes_outputs() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        let cancel = Arc::new(AtomicBool::new(true));
        let writer = OutputWriter::new(
            &opts,
            Arc::clone(&store),
            Arc::new(AtomicU64::new(1)),
            preserve(),
            &[],
            Vec::new(),
            Some(cancel),
        );
        let err = writer
            .run(compaction_iter(&cache, kvs(10, 10), Vec::new()))
            .expect_err("cancelled");
        assert!(matches!(base::classify(&err), Some(base::Error::Cancelled)));
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn empty_input_writes_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, cache) = setup(dir.path())?;
        let opts = small_opts();
        let writer = OutputWriter::new(&opts, Arc::clone(&store), Arc::new(AtomicU64::new(1)), preserve(), &[], Vec::new(), None);
        let res = writer.run(compaction_iter(&cache, Vec::new(), Vec::new()))?;
        assert!(res.tables.is_empty());
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn grandparent_overlap_stops_output() {
        let files: Vec<Arc<FileMetadata>> = ["b", "d", "f"]
            .iter()
            .enumerate()
            .map(|(i, k)| {
                Arc::new(FileMetadata::new(
                    i as u64 + 1,
                    60,
                    InternalKey::new(*k, 1, InternalKeyKind::Set),
                    InternalKey::new(*k, 1, InternalKeyKind::Set),
                    1,
                    1,
                    crate::file_metadata::FileBacking::new(i as u64 + 1, 60),
                    false,
                ))
            })
            .collect();
        let mut g = GrandparentOverlap {
            files: &files,
            index: 0,
            overlapped: 0,
            seen_key: false,
        };
        let cmp = &DEFAULT_COMPARER;
        assert!(!g.should_stop_before(cmp, b"a", 100));
        assert!(!g.should_stop_before(cmp, b"c", 100));
        // passing b and d accumulates 120 bytes
        assert!(g.should_stop_before(cmp, b"e", 100));
        assert!(!g.should_stop_before(cmp, b"g", 100));
    }
}
