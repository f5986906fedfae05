/// Read path: `get()`, `scan()`, iterators, snapshots and introspection.
///
/// Point lookups merge only the sources whose key range can hold the key;
/// range scans go through a full [`Iterator`]. Both resolve each user key
/// at a sequence number, so a read never observes a write published after
/// it started.
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use base::{InternalIterator, SeqNum};
use sstable::MergingIter;

use crate::iterator::{self, collect_spans, resolve_point, visible_tombstones, IterOptions};
use crate::picker;
use crate::snapshot::Snapshot;
use crate::version::NUM_LEVELS;
use crate::{Engine, EngineInner, LevelMetrics, Metrics};

impl Engine {
    /// Looks up a key, returning its value if it is live.
    ///
    /// # Errors
    ///
    /// Returns an error if a table or blob file read fails (corruption,
    /// I/O).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get_at(key, self.inner.versions.visible_seq())
    }

    /// Scans `[start, end)`, returning all live key-value pairs in
    /// ascending key order.
    ///
    /// # Arguments
    ///
    /// * `start` — inclusive lower bound. Pass `b""` to start from the
    ///   beginning.
    /// * `end` — exclusive upper bound. Pass `b""` to scan to the end.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner
            .scan_at(start, end, self.inner.versions.visible_seq())
    }

    /// Opens an iterator over the current state.
    pub fn new_iter(&self, opts: IterOptions) -> Result<iterator::Iterator> {
        iterator::Iterator::new(
            Arc::clone(&self.inner),
            opts,
            self.inner.versions.visible_seq(),
        )
    }

    /// Pins the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(Arc::clone(&self.inner))
    }

    /// Renders the level structure, one line per level and one per file.
    #[must_use]
    pub fn lsm(&self) -> String {
        let version = self.inner.versions.current();
        let mut out = String::new();
        for level in 0..NUM_LEVELS {
            let files = version.files(level);
            if files.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "L{}: {} files, {} bytes",
                level,
                files.len(),
                version.level_size(level)
            );
            for f in files {
                let _ = writeln!(
                    out,
                    "  {:06}:[{} - {}] {} bytes seqs {}..={}",
                    f.file_num,
                    f.smallest.user_key.escape_ascii(),
                    f.largest.user_key.escape_ascii(),
                    f.size,
                    f.smallest_seq,
                    f.largest_seq,
                );
            }
        }
        let blobs = version.blob_files();
        if !blobs.is_empty() {
            let _ = writeln!(
                out,
                "blob files: {}, {} bytes",
                blobs.len(),
                blobs.values().map(|b| b.size).sum::<u64>()
            );
        }
        if out.is_empty() {
            out.push_str("(empty)\n");
        }
        out
    }

    #[must_use]
    pub fn metrics(&self) -> Metrics {
        let inner = &self.inner;
        let version = inner.versions.current();
        let scores = picker::level_scores(&version, &inner.opts);
        let levels = (0..NUM_LEVELS)
            .map(|level| LevelMetrics {
                files: version.num_files(level),
                size: version.level_size(level),
                score: scores
                    .iter()
                    .find(|(l, _)| *l == level)
                    .map_or(0.0, |(_, s)| *s),
            })
            .collect();
        let (memtable_size, immutable_memtables) = {
            let m = inner.mem.read();
            (m.mutable.approx_size(), m.immutables.len())
        };
        Metrics {
            levels,
            blob_files: version.blob_files().len(),
            blob_size: version.blob_files().values().map(|b| b.size).sum(),
            memtable_size,
            immutable_memtables,
            flushes: inner.flushes.load(Ordering::Relaxed),
            flush_bytes: inner.flush_bytes.load(Ordering::Relaxed),
            compactions: inner.compactions.lock().metrics.clone(),
            snapshots: inner.snapshots.len(),
            open_tables: inner.cache.open_tables(),
            visible_seq: inner.versions.visible_seq(),
            version: inner.versions.version_num(),
            next_file_num: inner.versions.next_file_num(),
        }
    }
}

impl EngineInner {
    /// The value of `key` at `seq`.
    pub(crate) fn get_at(&self, key: &[u8], seq: SeqNum) -> Result<Option<Vec<u8>>> {
        let cmp = self.opts.comparer;
        let (mems, version) = self.read_state();

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for m in &mems {
            children.push(Box::new(m.iter()));
        }
        // Tables the filter rules out still contribute their range
        // deletions.
        let prefix = cmp.prefix(key);
        let mut files = Vec::new();
        for level in 0..NUM_LEVELS {
            for f in version.overlapping(level, key, key) {
                let reader = self.cache.table(&f)?;
                if reader.may_contain_prefix(prefix) {
                    children.push(Box::new(reader.iter(f.iter_options())));
                }
                files.push(f);
            }
        }
        let (dels, _) = collect_spans(cmp, &self.cache, &mems, &files)?;
        let tombstones = visible_tombstones(cmp, dels, seq);

        let mut iter = MergingIter::new(cmp, children);
        iter.seek_ge(key)?;
        let mut versions = Vec::new();
        while let Some(kv) = iter.current() {
            if !cmp.equal(&kv.key.user_key, key) {
                break;
            }
            versions.push(kv.clone());
            iter.next()?;
        }
        resolve_point(
            cmp,
            self.opts.merger,
            self.cache.as_ref(),
            key,
            &versions,
            seq,
            &tombstones,
        )
    }

    /// Live pairs in `[start, end)` at `seq`; empty bounds are open.
    pub(crate) fn scan_at(
        self: &Arc<Self>,
        start: &[u8],
        end: &[u8],
        seq: SeqNum,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if !start.is_empty()
            && !end.is_empty()
            && self.opts.comparer.cmp(start, end) != std::cmp::Ordering::Less
        {
            return Ok(Vec::new());
        }
        let opts = IterOptions {
            lower_bound: (!start.is_empty()).then(|| start.to_vec()),
            upper_bound: (!end.is_empty()).then(|| end.to_vec()),
            ..IterOptions::default()
        };
        let mut it = iterator::Iterator::new(Arc::clone(self), opts, seq)?;
        let mut out = Vec::new();
        let mut valid = it.first()?;
        while valid {
            if let (Some(k), Some(v)) = (it.key(), it.value()) {
                out.push((k.to_vec(), v.to_vec()));
            }
            valid = it.next()?;
        }
        Ok(out)
    }
}
