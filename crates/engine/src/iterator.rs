//! The user-facing iterator.
//!
//! Point keys come from a [`MergingIter`] over the memtables and every
//! table of a pinned version; all versions of a user key are resolved into
//! at most one visible value. Range deletions and range keys are collected
//! up front, fragmented and filtered to the read sequence number.
//!
//! With range keys enabled the iterator stops at every point key and at
//! every range key start:
//!
//! ```text
//! range keys:   [a ----- c)        [e ---- g)
//! points:          b         d        f
//! stops:        a  b         d     e  f
//!               R  P+R       P     R  P+R
//! ```

use std::cmp::Ordering;
use std::iter::Iterator as _;
use std::sync::Arc;

use anyhow::Result;
use base::keyspan::{coalesce_range_keys, defragment, find_containing, fragment};
use base::{
    invalid_argument, Comparer, InternalIterator, InternalKeyKind, InternalKv, Merger, SeqNum, Span,
    SpanKey, ValueFetcher,
};
use memtable::Memtable;
use sstable::MergingIter;
use tracing::trace;

use crate::compaction::file_spans;
use crate::file_cache::FileCache;
use crate::file_metadata::FileMetadata;
use crate::level_iter::LevelIter;
use crate::version::{Version, NUM_LEVELS};
use crate::EngineInner;

/// Which kinds of keys an iterator surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyTypes {
    #[default]
    PointsOnly,
    RangesOnly,
    PointsAndRanges,
}

impl KeyTypes {
    fn points(self) -> bool {
        self != KeyTypes::RangesOnly
    }

    fn ranges(self) -> bool {
        self != KeyTypes::PointsOnly
    }
}

#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    /// Inclusive.
    pub lower_bound: Option<Vec<u8>>,
    /// Exclusive.
    pub upper_bound: Option<Vec<u8>>,
    pub key_types: KeyTypes,
    /// Range keys with a suffix at or after this one hide the covered
    /// point keys whose suffix sorts after theirs.
    pub range_key_masking_suffix: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Unpositioned,
    Valid,
    /// The next stop lies beyond the limit of a `..._with_limit` call.
    AtLimit,
    Exhausted,
    Errored,
}

/// Outcome of a `..._with_limit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterValidity {
    Valid,
    AtLimit,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Where the point cursor sits relative to the last user key it resolved.
#[derive(Debug, Clone)]
enum Cursor {
    Unknown,
    /// Forward, just past every version of the key.
    After(Vec<u8>),
    /// Backward, just before every version of the key.
    Before(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Stop {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    /// Index into `range_keys`.
    span: Option<usize>,
}

pub struct Iterator {
    cmp: &'static Comparer,
    merger: &'static Merger,
    fetcher: Arc<FileCache>,
    seq: SeqNum,
    opts: IterOptions,
    points: MergingIter,
    /// Visible range deletions, fragmented.
    tombstones: Vec<Span>,
    /// Visible range keys after coalescing, unclipped.
    spans: Vec<Span>,
    /// `spans` clipped to the bounds.
    range_keys: Vec<Span>,
    cursor: Cursor,
    state: IterState,
    pos: Option<Stop>,
    pending: Option<(Direction, Stop)>,
    prefix: Option<Vec<u8>>,
    range_key_changed: bool,
    // Pin every source for the iterator's lifetime.
    _version: Arc<Version>,
    _mems: Vec<Arc<Memtable>>,
    _inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Iterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iterator")
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("key", &self.key().map(String::from_utf8_lossy))
            .finish()
    }
}

/// Files of `version` at `level` that may hold keys within the bounds.
fn files_in_bounds(version: &Version, level: usize, opts: &IterOptions) -> Vec<Arc<FileMetadata>> {
    let cmp = version.comparer();
    version
        .files(level)
        .iter()
        .filter(|f| {
            let above = opts
                .lower_bound
                .as_ref()
                .is_some_and(|lo| cmp.cmp(&f.largest.user_key, lo) == Ordering::Less);
            let below = opts
                .upper_bound
                .as_ref()
                .is_some_and(|hi| cmp.cmp(&f.smallest.user_key, hi) != Ordering::Less);
            !above && !below
        })
        .cloned()
        .collect()
}

/// Range deletions and range keys of every source, unfragmented.
pub(crate) fn collect_spans(
    cmp: &'static Comparer,
    cache: &FileCache,
    mems: &[Arc<Memtable>],
    files: &[Arc<FileMetadata>],
) -> Result<(Vec<Span>, Vec<Span>)> {
    let mut dels = Vec::new();
    let mut keys = Vec::new();
    for m in mems {
        dels.extend(m.range_dels());
        keys.extend(m.range_keys());
    }
    for f in files {
        if f.stats.num_range_deletions == 0 && f.stats.num_range_keys == 0 {
            continue;
        }
        let reader = cache.table(f)?;
        let (d, k) = file_spans(cmp, &reader, f);
        dels.extend(d);
        keys.extend(k);
    }
    Ok((dels, keys))
}

/// Fragments of `spans` restricted to keys visible at `seq`.
pub(crate) fn visible_tombstones(cmp: &Comparer, spans: Vec<Span>, seq: SeqNum) -> Vec<Span> {
    fragment(cmp, spans)
        .into_iter()
        .map(|s| s.visible(seq))
        .filter(|s| !s.is_empty())
        .collect()
}

/// The live range keys at `seq`: coalesced per fragment, empty fragments
/// dropped and abutting fragments with the same keys joined.
pub(crate) fn visible_range_keys(cmp: &Comparer, spans: Vec<Span>, seq: SeqNum) -> Vec<Span> {
    let coalesced = fragment(cmp, spans).into_iter().filter_map(|s| {
        let keys = coalesce_range_keys(cmp, &s.visible(seq).keys);
        (!keys.is_empty()).then(|| Span {
            start: s.start,
            end: s.end,
            keys,
        })
    });
    defragment(cmp, coalesced, |a, b| {
        a.keys.len() == b.keys.len()
            && a.keys
                .iter()
                .zip(&b.keys)
                .all(|(x, y)| x.suffix == y.suffix && x.value == y.value)
    })
}

/// The value of `key` at `seq` given its versions (newest first), or
/// `None` when it is deleted or was never written.
pub(crate) fn resolve_point(
    cmp: &Comparer,
    merger: &Merger,
    fetcher: &dyn ValueFetcher,
    key: &[u8],
    versions: &[InternalKv],
    seq: SeqNum,
    tombstones: &[Span],
) -> Result<Option<Vec<u8>>> {
    let deleted_below = find_containing(cmp, tombstones, key).map_or(0, |i| {
        tombstones[i]
            .keys
            .iter()
            .filter(|k| k.kind() == InternalKeyKind::RangeDelete && k.seq() <= seq)
            .map(SpanKey::seq)
            .max()
            .unwrap_or(0)
    });
    let mut operands = Vec::new();
    let mut base = None;
    for kv in versions {
        let s = kv.key.seq();
        if s > seq {
            continue;
        }
        if s < deleted_below {
            break;
        }
        match kv.key.kind() {
            InternalKeyKind::Set => {
                base = Some(kv.value.fetch(fetcher)?);
                break;
            }
            InternalKeyKind::Merge => operands.push(kv.value.fetch(fetcher)?),
            _ => break,
        }
    }
    if operands.is_empty() {
        return Ok(base);
    }
    operands.reverse();
    Ok(Some(merger.fold(
        key,
        base.as_deref(),
        operands.iter().map(Vec::as_slice),
    )))
}

impl Iterator {
    pub(crate) fn new(inner: Arc<EngineInner>, opts: IterOptions, seq: SeqNum) -> Result<Self> {
        let cmp = inner.opts.comparer;
        let (mems, version) = inner.read_state();
        let cache = Arc::clone(&inner.cache);

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        let mut all_files = Vec::new();
        for m in &mems {
            children.push(Box::new(m.iter()));
        }
        for level in 0..NUM_LEVELS {
            let files = files_in_bounds(&version, level, &opts);
            if files.is_empty() {
                continue;
            }
            if level == 0 {
                for f in &files {
                    let reader = cache.table(f)?;
                    children.push(Box::new(reader.iter(f.iter_options())));
                }
            } else {
                children.push(Box::new(LevelIter::new(cmp, Arc::clone(&cache), files.clone())));
            }
            all_files.extend(files);
        }

        let (dels, keys) = collect_spans(cmp, &cache, &mems, &all_files)?;
        let tombstones = visible_tombstones(cmp, dels, seq);
        let spans = if opts.key_types.ranges() || opts.range_key_masking_suffix.is_some() {
            visible_range_keys(cmp, keys, seq)
        } else {
            Vec::new()
        };
        trace!(
            sources = children.len(),
            tombstones = tombstones.len(),
            range_keys = spans.len(),
            seq,
            "iterator opened"
        );

        let mut it = Self {
            cmp,
            merger: inner.opts.merger,
            fetcher: cache,
            seq,
            opts,
            points: MergingIter::new(cmp, children),
            tombstones,
            spans,
            range_keys: Vec::new(),
            cursor: Cursor::Unknown,
            state: IterState::Unpositioned,
            pos: None,
            pending: None,
            prefix: None,
            range_key_changed: false,
            _version: version,
            _mems: mems,
            _inner: inner,
        };
        it.clip_range_keys();
        Ok(it)
    }

    fn clip_range_keys(&mut self) {
        let cmp = self.cmp;
        let lo = self.opts.lower_bound.as_deref();
        let hi = self.opts.upper_bound.as_deref();
        self.range_keys = if self.opts.key_types.ranges() {
            self.spans
                .iter()
                .filter_map(|s| {
                    let start = lo.map_or(s.start.as_slice(), |lo| cmp.max(&s.start, lo)).to_vec();
                    let end = hi.map_or(s.end.as_slice(), |hi| cmp.min(&s.end, hi)).to_vec();
                    (cmp.cmp(&start, &end) == Ordering::Less).then(|| Span {
                        start,
                        end,
                        keys: s.keys.clone(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    /// Sequence number the iterator reads at.
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn valid(&self) -> bool {
        self.state == IterState::Valid
    }

    // ---- Point resolution ----

    fn resolve(&self, key: &[u8], versions: &[InternalKv]) -> Result<Option<Vec<u8>>> {
        let value = resolve_point(
            self.cmp,
            self.merger,
            self.fetcher.as_ref(),
            key,
            versions,
            self.seq,
            &self.tombstones,
        )?;
        Ok(value.filter(|_| !self.masked(key)))
    }

    /// True if a covering range key masks `key`.
    fn masked(&self, key: &[u8]) -> bool {
        let Some(mask) = &self.opts.range_key_masking_suffix else {
            return false;
        };
        let suffix = self.cmp.suffix(key);
        if suffix.is_empty() {
            return false;
        }
        let Some(i) = find_containing(self.cmp, &self.spans, key) else {
            return false;
        };
        self.spans[i].keys.iter().any(|k| {
            k.kind() == InternalKeyKind::RangeKeySet
                && !k.suffix.is_empty()
                && self.cmp.cmp_suffix(&k.suffix, mask) != Ordering::Less
                && self.cmp.cmp_suffix(suffix, &k.suffix) == Ordering::Greater
        })
    }

    fn in_prefix(&self, key: &[u8]) -> bool {
        self.prefix
            .as_ref()
            .map_or(true, |p| self.cmp.equal(self.cmp.prefix(key), p))
    }

    /// Next visible point with a user key `>= from` (or `> from`).
    fn next_point(&mut self, from: &[u8], inclusive: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reuse = !inclusive && matches!(&self.cursor, Cursor::After(k) if self.cmp.equal(k, from));
        if !reuse {
            self.points.seek_ge(from)?;
            if !inclusive {
                while self
                    .points
                    .current()
                    .is_some_and(|kv| self.cmp.equal(&kv.key.user_key, from))
                {
                    self.points.next()?;
                }
            }
        }
        loop {
            let Some(kv) = self.points.current() else {
                self.cursor = Cursor::Unknown;
                return Ok(None);
            };
            let key = kv.key.user_key.clone();
            let past_upper = self
                .opts
                .upper_bound
                .as_ref()
                .is_some_and(|hi| self.cmp.cmp(&key, hi) != Ordering::Less);
            if past_upper || !self.in_prefix(&key) {
                self.cursor = Cursor::Unknown;
                return Ok(None);
            }
            let mut versions = Vec::new();
            while let Some(kv) = self.points.current() {
                if !self.cmp.equal(&kv.key.user_key, &key) {
                    break;
                }
                versions.push(kv.clone());
                self.points.next()?;
            }
            self.cursor = Cursor::After(key.clone());
            if let Some(v) = self.resolve(&key, &versions)? {
                return Ok(Some((key, v)));
            }
        }
    }

    /// Previous visible point with a user key `< from`, or the last one.
    fn prev_point(&mut self, from: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reuse = matches!((&self.cursor, from), (Cursor::Before(k), Some(f)) if self.cmp.equal(k, f));
        if !reuse {
            match from {
                Some(k) => self.points.seek_lt(k)?,
                None => self.points.last()?,
            }
        }
        loop {
            let Some(kv) = self.points.current() else {
                self.cursor = Cursor::Unknown;
                return Ok(None);
            };
            let key = kv.key.user_key.clone();
            let before_lower = self
                .opts
                .lower_bound
                .as_ref()
                .is_some_and(|lo| self.cmp.cmp(&key, lo) == Ordering::Less);
            if before_lower || !self.in_prefix(&key) {
                self.cursor = Cursor::Unknown;
                return Ok(None);
            }
            let mut versions = Vec::new();
            while let Some(kv) = self.points.current() {
                if !self.cmp.equal(&kv.key.user_key, &key) {
                    break;
                }
                versions.push(kv.clone());
                self.points.prev()?;
            }
            versions.reverse();
            self.cursor = Cursor::Before(key.clone());
            if let Some(v) = self.resolve(&key, &versions)? {
                return Ok(Some((key, v)));
            }
        }
    }

    // ---- Stops ----

    fn make_stop(&self, key: Vec<u8>, point: Option<(Vec<u8>, Vec<u8>)>) -> Stop {
        let value = point.and_then(|(k, v)| self.cmp.equal(&k, &key).then_some(v));
        let span = find_containing(self.cmp, &self.range_keys, &key);
        Stop { key, value, span }
    }

    /// The first stop at or after `from`. `seek` also stops at `from` when
    /// it lies inside a range key.
    fn stop_forward(&mut self, from: &[u8], inclusive: bool, seek: bool) -> Result<Option<Stop>> {
        let point = if self.opts.key_types.points() {
            self.next_point(from, inclusive)?
        } else {
            None
        };
        let cmp = self.cmp;
        let span_key = if seek && find_containing(cmp, &self.range_keys, from).is_some() {
            Some(from.to_vec())
        } else {
            let i = self.range_keys.partition_point(|s| match cmp.cmp(&s.start, from) {
                Ordering::Less => true,
                Ordering::Equal => !inclusive,
                Ordering::Greater => false,
            });
            self.range_keys.get(i).map(|s| s.start.clone())
        };
        let key = match (&point, span_key) {
            (None, None) => return Ok(None),
            (Some((p, _)), None) => p.clone(),
            (None, Some(s)) => s,
            (Some((p, _)), Some(s)) => cmp.min(p, &s).to_vec(),
        };
        if !self.in_prefix(&key) {
            return Ok(None);
        }
        Ok(Some(self.make_stop(key, point)))
    }

    /// The last stop before `from` (or the very last one).
    fn stop_backward(&mut self, from: Option<&[u8]>) -> Result<Option<Stop>> {
        let point = if self.opts.key_types.points() {
            self.prev_point(from)?
        } else {
            None
        };
        let cmp = self.cmp;
        let i = match from {
            Some(f) => self
                .range_keys
                .partition_point(|s| cmp.cmp(&s.start, f) == Ordering::Less),
            None => self.range_keys.len(),
        };
        let span_key = i.checked_sub(1).map(|i| self.range_keys[i].start.clone());
        let key = match (&point, span_key) {
            (None, None) => return Ok(None),
            (Some((p, _)), None) => p.clone(),
            (None, Some(s)) => s,
            (Some((p, _)), Some(s)) => cmp.max(p, &s).to_vec(),
        };
        if !self.in_prefix(&key) {
            return Ok(None);
        }
        Ok(Some(self.make_stop(key, point)))
    }

    fn span_of(&self, stop: Option<&Stop>) -> Option<&Span> {
        stop.and_then(|s| s.span).map(|i| &self.range_keys[i])
    }

    /// Moves to `stop`, tracking whether the covering range key changed.
    fn land(&mut self, stop: Option<Stop>, absolute: bool) -> bool {
        let new_span = self.span_of(stop.as_ref()).cloned();
        self.range_key_changed = if absolute {
            new_span.is_some()
        } else {
            self.span_of(self.pos.as_ref()) != new_span.as_ref()
        };
        self.pending = None;
        match stop {
            Some(s) => {
                self.pos = Some(s);
                self.state = IterState::Valid;
                true
            }
            None => {
                self.pos = None;
                self.state = IterState::Exhausted;
                false
            }
        }
    }

    fn fail<T>(&mut self, e: anyhow::Error) -> Result<T> {
        self.state = IterState::Errored;
        self.pos = None;
        self.pending = None;
        self.cursor = Cursor::Unknown;
        Err(e)
    }

    fn clamp_lower<'a>(&'a self, key: &'a [u8]) -> &'a [u8] {
        match &self.opts.lower_bound {
            Some(lo) => self.cmp.max(key, lo),
            None => key,
        }
    }

    fn clamp_upper<'a>(&'a self, key: Option<&'a [u8]>) -> Option<&'a [u8]> {
        match (key, self.opts.upper_bound.as_deref()) {
            (Some(k), Some(hi)) => Some(self.cmp.min(k, hi)),
            (Some(k), None) => Some(k),
            (None, hi) => hi,
        }
    }

    // ---- Absolute positioning ----

    fn seek_forward(&mut self, key: &[u8], limit: Option<&[u8]>) -> Result<IterValidity> {
        let from = self.clamp_lower(key).to_vec();
        match self.stop_forward(&from, true, true) {
            Ok(stop) => Ok(self.finish_forward(stop, limit, true)),
            Err(e) => self.fail(e),
        }
    }

    fn seek_backward(&mut self, key: Option<&[u8]>, limit: Option<&[u8]>) -> Result<IterValidity> {
        let from = self.clamp_upper(key).map(<[u8]>::to_vec);
        if let (Some(f), Some(lo)) = (&from, &self.opts.lower_bound) {
            if self.cmp.cmp(f, lo) != Ordering::Greater {
                return Ok(self.finish_backward(None, limit, true));
            }
        }
        match self.stop_backward(from.as_deref()) {
            Ok(stop) => Ok(self.finish_backward(stop, limit, true)),
            Err(e) => self.fail(e),
        }
    }

    fn finish_forward(&mut self, stop: Option<Stop>, limit: Option<&[u8]>, absolute: bool) -> IterValidity {
        if let (Some(s), Some(limit)) = (&stop, limit) {
            if self.cmp.cmp(&s.key, limit) != Ordering::Less {
                self.hold(Direction::Forward, stop, absolute);
                return IterValidity::AtLimit;
            }
        }
        if self.land(stop, absolute) {
            IterValidity::Valid
        } else {
            IterValidity::Exhausted
        }
    }

    fn finish_backward(&mut self, stop: Option<Stop>, limit: Option<&[u8]>, absolute: bool) -> IterValidity {
        if let (Some(s), Some(limit)) = (&stop, limit) {
            if self.cmp.cmp(&s.key, limit) == Ordering::Less {
                self.hold(Direction::Backward, stop, absolute);
                return IterValidity::AtLimit;
            }
        }
        if self.land(stop, absolute) {
            IterValidity::Valid
        } else {
            IterValidity::Exhausted
        }
    }

    /// Parks a stop that lies beyond a limit until a later call reaches it.
    fn hold(&mut self, dir: Direction, stop: Option<Stop>, absolute: bool) {
        if let Some(s) = stop {
            if absolute {
                self.pos = None;
            }
            self.pending = Some((dir, s));
        }
        self.state = IterState::AtLimit;
    }

    pub fn first(&mut self) -> Result<bool> {
        self.prefix = None;
        let from = self.opts.lower_bound.clone().unwrap_or_default();
        Ok(self.seek_forward(&from, None)? == IterValidity::Valid)
    }

    pub fn last(&mut self) -> Result<bool> {
        self.prefix = None;
        Ok(self.seek_backward(None, None)? == IterValidity::Valid)
    }

    /// Positions at the first key `>= key`.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<bool> {
        self.prefix = None;
        Ok(self.seek_forward(key, None)? == IterValidity::Valid)
    }

    pub fn seek_ge_with_limit(&mut self, key: &[u8], limit: &[u8]) -> Result<IterValidity> {
        self.prefix = None;
        self.seek_forward(key, Some(limit))
    }

    /// Like [`Iterator::seek_ge`], but the iterator only visits keys
    /// sharing `key`'s prefix until the next absolute positioning.
    pub fn seek_prefix_ge(&mut self, key: &[u8]) -> Result<bool> {
        self.prefix = Some(self.cmp.prefix(key).to_vec());
        Ok(self.seek_forward(key, None)? == IterValidity::Valid)
    }

    /// Positions at the last key `< key`.
    pub fn seek_lt(&mut self, key: &[u8]) -> Result<bool> {
        self.prefix = None;
        Ok(self.seek_backward(Some(key), None)? == IterValidity::Valid)
    }

    pub fn seek_lt_with_limit(&mut self, key: &[u8], limit: &[u8]) -> Result<IterValidity> {
        self.prefix = None;
        self.seek_backward(Some(key), Some(limit))
    }

    // ---- Relative positioning ----

    fn step_forward(&mut self, limit: Option<&[u8]>) -> Result<IterValidity> {
        match self.state {
            IterState::Unpositioned => {
                return Err(invalid_argument("iterator is not positioned"));
            }
            IterState::Errored => return Err(invalid_argument("iterator is in an error state")),
            IterState::Exhausted if self.pos.is_none() => return Ok(IterValidity::Exhausted),
            _ => {}
        }
        if let Some((Direction::Forward, stop)) = self.pending.take() {
            return Ok(self.finish_forward(Some(stop), limit, false));
        }
        let Some(cur) = self.pos.as_ref().map(|s| s.key.clone()) else {
            return Ok(IterValidity::Exhausted);
        };
        match self.stop_forward(&cur, false, false) {
            Ok(stop) => Ok(self.finish_forward(stop, limit, false)),
            Err(e) => self.fail(e),
        }
    }

    fn step_backward(&mut self, limit: Option<&[u8]>) -> Result<IterValidity> {
        match self.state {
            IterState::Unpositioned => {
                return Err(invalid_argument("iterator is not positioned"));
            }
            IterState::Errored => return Err(invalid_argument("iterator is in an error state")),
            IterState::Exhausted if self.pos.is_none() => return Ok(IterValidity::Exhausted),
            _ => {}
        }
        if let Some((Direction::Backward, stop)) = self.pending.take() {
            return Ok(self.finish_backward(Some(stop), limit, false));
        }
        let Some(cur) = self.pos.as_ref().map(|s| s.key.clone()) else {
            return Ok(IterValidity::Exhausted);
        };
        match self.stop_backward(Some(&cur)) {
            Ok(stop) => Ok(self.finish_backward(stop, limit, false)),
            Err(e) => self.fail(e),
        }
    }

    pub fn next(&mut self) -> Result<bool> {
        Ok(self.step_forward(None)? == IterValidity::Valid)
    }

    pub fn prev(&mut self) -> Result<bool> {
        Ok(self.step_backward(None)? == IterValidity::Valid)
    }

    /// Steps forward, stopping with [`IterValidity::AtLimit`] if the next
    /// key is `>= limit`.
    pub fn next_with_limit(&mut self, limit: &[u8]) -> Result<IterValidity> {
        self.step_forward(Some(limit))
    }

    /// Steps backward, stopping with [`IterValidity::AtLimit`] if the
    /// previous key is `< limit`.
    pub fn prev_with_limit(&mut self, limit: &[u8]) -> Result<IterValidity> {
        self.step_backward(Some(limit))
    }

    /// Moves to the first key whose prefix differs from the current one.
    pub fn next_prefix(&mut self) -> Result<bool> {
        let Some(cur) = self.key() else {
            return Err(invalid_argument("next_prefix on an unpositioned iterator"));
        };
        let prefix = self.cmp.prefix(cur).to_vec();
        let was_changed = self.span_of(self.pos.as_ref()).cloned();
        loop {
            if !self.next()? {
                return Ok(false);
            }
            let Some(key) = self.key() else {
                return Ok(false);
            };
            if !self.cmp.equal(self.cmp.prefix(key), &prefix) {
                self.range_key_changed = self.span_of(self.pos.as_ref()) != was_changed.as_ref();
                return Ok(true);
            }
        }
    }

    /// Replaces the bounds. The iterator must be repositioned afterwards.
    pub fn set_bounds(&mut self, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) {
        self.opts.lower_bound = lower;
        self.opts.upper_bound = upper;
        self.clip_range_keys();
        self.state = IterState::Unpositioned;
        self.pos = None;
        self.pending = None;
        self.prefix = None;
        self.cursor = Cursor::Unknown;
        self.range_key_changed = false;
    }

    // ---- Accessors ----

    fn current(&self) -> Option<&Stop> {
        if self.state == IterState::Valid {
            self.pos.as_ref()
        } else {
            None
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current().map(|s| s.key.as_slice())
    }

    /// The point value at the current position, if there is a point key.
    pub fn value(&self) -> Option<&[u8]> {
        self.current().and_then(|s| s.value.as_deref())
    }

    /// Whether the current position has a point key and a range key.
    pub fn has_point_and_range(&self) -> (bool, bool) {
        self.current()
            .map_or((false, false), |s| (s.value.is_some(), s.span.is_some()))
    }

    /// Bounds of the range key covering the current position.
    pub fn range_bounds(&self) -> Option<(&[u8], &[u8])> {
        self.span_of(self.current())
            .map(|s| (s.start.as_slice(), s.end.as_slice()))
    }

    /// Live range keys covering the current position, sorted by suffix.
    pub fn range_keys(&self) -> &[SpanKey] {
        self.span_of(self.current()).map_or(&[], |s| s.keys.as_slice())
    }

    /// True if the last positioning call moved onto a different range key
    /// (or off one).
    pub fn range_key_changed(&self) -> bool {
        self.range_key_changed
    }

    /// True if the current point key has exactly one visible version and
    /// it is a SET, so a SINGLEDEL would delete it deterministically.
    pub fn can_deterministically_single_delete(&mut self) -> Result<bool> {
        let Some(stop) = self.current().filter(|s| s.value.is_some()).cloned() else {
            return Err(invalid_argument("iterator is not positioned at a point key"));
        };
        if let Err(e) = self.points.seek_ge(&stop.key) {
            return self.fail(e);
        }
        self.cursor = Cursor::Unknown;
        let mut visible = Vec::new();
        while let Some(kv) = self.points.current() {
            if !self.cmp.equal(&kv.key.user_key, &stop.key) {
                break;
            }
            if kv.key.seq() <= self.seq {
                visible.push(kv.key.kind());
            }
            if let Err(e) = self.points.next() {
                return self.fail(e);
            }
        }
        self.cursor = Cursor::After(stop.key);
        Ok(visible.len() == 1 && visible[0] == InternalKeyKind::Set)
    }
}
