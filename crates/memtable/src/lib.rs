//! # Memtable - in-memory write buffer
//!
//! Every committed write lands here after it has been appended to the WAL.
//! Unlike a plain map, the memtable keeps **every version** of a key, keyed
//! by internal key, so readers at older sequence numbers and snapshots see
//! a consistent view:
//!
//! ```text
//! points:      a#7,SET  a#3,DEL  b#5,MERGE  b#4,SET  ...   (comparer order)
//! range_dels:  [c-f)#6
//! range_keys:  [a-m)#8 @2=foo
//! ```
//!
//! Range deletions and range keys are stored unfragmented, one span per
//! write; readers fragment them on demand.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Result;
use base::{
    Comparer, InternalIterator, InternalKey, InternalKeyKind, InternalKv, SeqNum, Span, SpanKey,
    TRAILER_LEN,
};
use parking_lot::RwLock;

/// An internal key ordered by the database comparer.
#[derive(Clone)]
struct MemKey {
    key: InternalKey,
    cmp: &'static Comparer,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.cmp_internal(&self.key, &other.key)
    }
}

pub struct Memtable {
    cmp: &'static Comparer,
    points: RwLock<BTreeMap<MemKey, Vec<u8>>>,
    range_dels: RwLock<Vec<Span>>,
    range_keys: RwLock<Vec<Span>>,
    approx_size: AtomicUsize,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("points", &self.points.read().len())
            .field("range_dels", &self.range_dels.read().len())
            .field("range_keys", &self.range_keys.read().len())
            .field("approx_size", &self.approx_size())
            .finish()
    }
}

impl Memtable {
    pub fn new(cmp: &'static Comparer) -> Self {
        Self {
            cmp,
            points: RwLock::new(BTreeMap::new()),
            range_dels: RwLock::new(Vec::new()),
            range_keys: RwLock::new(Vec::new()),
            approx_size: AtomicUsize::new(0),
        }
    }

    pub fn comparer(&self) -> &'static Comparer {
        self.cmp
    }

    /// Records a point write (SET, DEL, SINGLEDEL or MERGE).
    ///
    /// Sequence numbers are unique per write, so an insert never replaces
    /// an existing entry.
    pub fn add(&self, seq: SeqNum, kind: InternalKeyKind, key: &[u8], value: &[u8]) {
        debug_assert!(kind.is_point());
        let k = MemKey {
            key: InternalKey::new(key.to_vec(), seq, kind),
            cmp: self.cmp,
        };
        self.approx_size
            .fetch_add(key.len() + value.len() + TRAILER_LEN, AtomicOrdering::Relaxed);
        self.points.write().insert(k, value.to_vec());
    }

    /// Records a range deletion or range key write over `[start, end)`.
    pub fn add_span(
        &self,
        seq: SeqNum,
        kind: InternalKeyKind,
        start: &[u8],
        end: &[u8],
        suffix: &[u8],
        value: &[u8],
    ) {
        let span = Span::new(
            start.to_vec(),
            end.to_vec(),
            vec![SpanKey::new(base::make_trailer(seq, kind), suffix, value)],
        );
        self.approx_size.fetch_add(
            start.len() + end.len() + suffix.len() + value.len() + TRAILER_LEN,
            AtomicOrdering::Relaxed,
        );
        if kind == InternalKeyKind::RangeDelete {
            self.range_dels.write().push(span);
        } else {
            self.range_keys.write().push(span);
        }
    }

    /// Newest version of `key` visible at `seq`, including tombstones.
    pub fn get(&self, key: &[u8], seq: SeqNum) -> Option<(InternalKey, Vec<u8>)> {
        let lo = MemKey {
            key: InternalKey::new(key.to_vec(), seq, InternalKeyKind::Max),
            cmp: self.cmp,
        };
        let map = self.points.read();
        map.range((Bound::Included(lo), Bound::Unbounded))
            .next()
            .filter(|(k, _)| self.cmp.equal(&k.key.user_key, key))
            .map(|(k, v)| (k.key.clone(), v.clone()))
    }

    /// Unfragmented range deletions.
    pub fn range_dels(&self) -> Vec<Span> {
        self.range_dels.read().clone()
    }

    /// Unfragmented range keys.
    pub fn range_keys(&self) -> Vec<Span> {
        self.range_keys.read().clone()
    }

    /// Number of writes recorded, spans included.
    pub fn len(&self) -> usize {
        self.points.read().len() + self.range_dels.read().len() + self.range_keys.read().len()
    }

    pub fn approx_size(&self) -> usize {
        self.approx_size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bidirectional cursor over the point entries.
    pub fn iter(self: &Arc<Self>) -> MemtableIter {
        MemtableIter {
            mem: Arc::clone(self),
            cur: None,
        }
    }

    fn kv(k: &MemKey, v: &[u8]) -> InternalKv {
        InternalKv::inline(k.key.clone(), v.to_vec())
    }

    fn wrap(&self, key: InternalKey) -> MemKey {
        MemKey { key, cmp: self.cmp }
    }
}

/// Cursor over a shared memtable.
///
/// The cursor holds a copy of the current entry and re-enters the map on
/// every step, so concurrent inserts are observed in order without holding
/// the lock between calls.
pub struct MemtableIter {
    mem: Arc<Memtable>,
    cur: Option<InternalKv>,
}

impl InternalIterator for MemtableIter {
    fn first(&mut self) -> Result<()> {
        let map = self.mem.points.read();
        self.cur = map.iter().next().map(|(k, v)| Memtable::kv(k, v));
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        let map = self.mem.points.read();
        self.cur = map.iter().next_back().map(|(k, v)| Memtable::kv(k, v));
        Ok(())
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        let lo = self.mem.wrap(InternalKey::search(key.to_vec()));
        let map = self.mem.points.read();
        self.cur = map
            .range((Bound::Included(lo), Bound::Unbounded))
            .next()
            .map(|(k, v)| Memtable::kv(k, v));
        Ok(())
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        let hi = self.mem.wrap(InternalKey::search(key.to_vec()));
        let map = self.mem.points.read();
        self.cur = map
            .range((Bound::Unbounded, Bound::Excluded(hi)))
            .next_back()
            .map(|(k, v)| Memtable::kv(k, v));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(cur) = self.cur.take() {
            let lo = self.mem.wrap(cur.key);
            let map = self.mem.points.read();
            self.cur = map
                .range((Bound::Excluded(lo), Bound::Unbounded))
                .next()
                .map(|(k, v)| Memtable::kv(k, v));
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if let Some(cur) = self.cur.take() {
            let hi = self.mem.wrap(cur.key);
            let map = self.mem.points.read();
            self.cur = map
                .range((Bound::Unbounded, Bound::Excluded(hi)))
                .next_back()
                .map(|(k, v)| Memtable::kv(k, v));
        }
        Ok(())
    }

    fn current(&self) -> Option<&InternalKv> {
        self.cur.as_ref()
    }
}
