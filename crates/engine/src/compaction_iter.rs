//! Decides which input keys survive a flush or compaction.
//!
//! Versions of one user key are processed together. Live snapshots split
//! the sequence numbers into stripes; the stripe of `s` is the number of
//! snapshots below `s`:
//!
//! ```text
//! snapshots:        5         9
//! seqs:      1 2 3 4 5 | 6 7 8 9 | 10 11 ...
//! stripe:        0     |    1    |    2
//! ```
//!
//! Two versions in the same stripe look the same to every reader, so only
//! the newest result of each stripe has to be kept. Stripe 0 holds the
//! oldest versions; tombstones there may be dropped once nothing older
//! exists below the output level.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use base::keyspan::{defragment, find_containing, fragment};
use base::{
    invariant, Comparer, InternalIterator, InternalKey, InternalKeyKind, InternalKv, Merger, SeqNum,
    Span, SpanKey, ValueFetcher,
};

/// Returns true when no level below the output holds keys in the
/// inclusive user key range `[start, end]`.
pub type ElideFn = Box<dyn Fn(&[u8], &[u8]) -> bool + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionIterStats {
    pub keys_in: u64,
    pub keys_out: u64,
    pub elided_tombstones: u64,
    pub shadowed: u64,
    pub merges_folded: u64,
}

pub struct CompactionIter {
    cmp: &'static Comparer,
    merger: &'static Merger,
    fetcher: Arc<dyn ValueFetcher>,
    iter: Box<dyn InternalIterator>,
    snapshots: Vec<SeqNum>,
    /// Input range deletions, fragmented. Used for shadowing.
    tombstones: Vec<Span>,
    range_dels: Vec<Span>,
    range_keys: Vec<Span>,
    elide: ElideFn,
    last_key: Option<InternalKey>,
    started: bool,
    stats: CompactionIterStats,
}

impl CompactionIter {
    /// `snapshots` must be sorted ascending.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cmp: &'static Comparer,
        merger: &'static Merger,
        fetcher: Arc<dyn ValueFetcher>,
        iter: Box<dyn InternalIterator>,
        snapshots: Vec<SeqNum>,
        range_dels: Vec<Span>,
        range_keys: Vec<Span>,
        elide: ElideFn,
    ) -> Self {
        let tombstones = fragment(cmp, range_dels);
        let range_dels = compact_range_dels(&tombstones, &snapshots, &elide);
        let range_keys = compact_range_keys(cmp, fragment(cmp, range_keys), &snapshots, &elide);
        Self {
            cmp,
            merger,
            fetcher,
            iter,
            snapshots,
            tombstones,
            range_dels,
            range_keys,
            elide,
            last_key: None,
            started: false,
            stats: CompactionIterStats::default(),
        }
    }

    /// Range deletion fragments to write, sorted.
    pub fn range_dels(&self) -> &[Span] {
        &self.range_dels
    }

    /// Range key spans to write, sorted and defragmented.
    pub fn range_keys(&self) -> &[Span] {
        &self.range_keys
    }

    pub fn stats(&self) -> CompactionIterStats {
        self.stats
    }

    fn stripe(&self, seq: SeqNum) -> usize {
        stripe(&self.snapshots, seq)
    }

    /// True if a range deletion in the same stripe as `seq` covers it.
    fn covered(&self, key: &[u8], seq: SeqNum) -> bool {
        let Some(i) = find_containing(self.cmp, &self.tombstones, key) else {
            return false;
        };
        let s = self.stripe(seq);
        self.tombstones[i].keys.iter().any(|t| {
            t.kind() == InternalKeyKind::RangeDelete && t.seq() > seq && self.stripe(t.seq()) == s
        })
    }

    /// Pulls every version of the next user key from the input.
    fn gather(&mut self) -> Result<Option<Vec<InternalKv>>> {
        if !self.started {
            self.started = true;
            self.iter.first()?;
        }
        let Some(first) = self.iter.current() else {
            return Ok(None);
        };
        let user_key = first.key.user_key.clone();
        let mut versions = Vec::new();
        while let Some(kv) = self.iter.current() {
            if !self.cmp.equal(&kv.key.user_key, &user_key) {
                break;
            }
            if let Some(last) = &self.last_key {
                if self.cmp.cmp_internal(last, &kv.key) != Ordering::Less {
                    return Err(invariant(format!(
                        "compaction input out of order: {} then {}",
                        last, kv.key
                    )));
                }
            }
            if !kv.key.kind().is_point() {
                return Err(invariant(format!("non-point key {} in point input", kv.key)));
            }
            self.last_key = Some(kv.key.clone());
            versions.push(kv.clone());
            self.iter.next()?;
        }
        if let Some(kv) = self.iter.current() {
            if self.cmp.cmp(&kv.key.user_key, &user_key) == Ordering::Less {
                return Err(invariant(format!(
                    "compaction input out of order: {} then {}",
                    self.last_key.as_ref().map(|k| k.to_string()).unwrap_or_default(),
                    kv.key
                )));
            }
        }
        self.stats.keys_in += versions.len() as u64;
        Ok(Some(versions))
    }

    /// The surviving versions of the next user key, newest first. An empty
    /// vector means every version of the key was dropped.
    pub fn next_user_key(&mut self) -> Result<Option<Vec<InternalKv>>> {
        let Some(versions) = self.gather()? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        let mut i = 0;
        while i < versions.len() {
            let s = self.stripe(versions[i].key.seq());
            let mut j = i + 1;
            while j < versions.len() && self.stripe(versions[j].key.seq()) == s {
                j += 1;
            }
            self.resolve_stripe(&versions, i, j, s, &mut out)?;
            i = j;
        }
        self.stats.keys_out += out.len() as u64;
        Ok(Some(out))
    }

    /// Resolves `versions[start..end]`, all in stripe `s`.
    fn resolve_stripe(
        &mut self,
        versions: &[InternalKv],
        start: usize,
        end: usize,
        s: usize,
        out: &mut Vec<InternalKv>,
    ) -> Result<()> {
        let user_key = versions[start].key.user_key.as_slice();
        let is_last_stripe = end == versions.len();
        // (newest merge seq, operands newest first)
        let mut merge: Option<(SeqNum, Vec<Vec<u8>>)> = None;

        for idx in start..end {
            let kv = &versions[idx];
            if self.covered(user_key, kv.key.seq()) {
                self.stats.shadowed += (end - idx) as u64;
                if let Some((seq, ops)) = merge.take() {
                    out.push(self.fold(user_key, seq, None, &ops));
                }
                return Ok(());
            }
            match kv.key.kind() {
                InternalKeyKind::Set => {
                    match merge.take() {
                        Some((seq, ops)) => {
                            let base = kv.value.fetch(self.fetcher.as_ref())?;
                            out.push(self.fold(user_key, seq, Some(&base), &ops));
                        }
                        None => out.push(kv.clone()),
                    }
                    self.stats.shadowed += (end - idx - 1) as u64;
                    return Ok(());
                }
                InternalKeyKind::Delete => {
                    if let Some((seq, ops)) = merge.take() {
                        out.push(self.fold(user_key, seq, None, &ops));
                    } else if s == 0 && (self.elide)(user_key, user_key) {
                        self.stats.elided_tombstones += 1;
                    } else {
                        out.push(kv.clone());
                    }
                    self.stats.shadowed += (end - idx - 1) as u64;
                    return Ok(());
                }
                InternalKeyKind::SingleDelete => {
                    if let Some((seq, ops)) = merge.take() {
                        out.push(self.fold(user_key, seq, None, &ops));
                    } else if idx + 1 == versions.len() && s == 0 && (self.elide)(user_key, user_key) {
                        // Nothing older anywhere for it to delete.
                        self.stats.elided_tombstones += 1;
                    } else if self.single_delete_elides(versions, idx, s) {
                        self.stats.elided_tombstones += 1;
                        self.stats.shadowed += 1;
                    } else {
                        out.push(kv.clone());
                        self.stats.shadowed += (end - idx - 1) as u64;
                    }
                    return Ok(());
                }
                InternalKeyKind::Merge => {
                    let operand = kv.value.fetch(self.fetcher.as_ref())?;
                    match merge.as_mut() {
                        Some((_, ops)) => ops.push(operand),
                        None => merge = Some((kv.key.seq(), vec![operand])),
                    }
                }
                kind => {
                    return Err(invariant(format!("unexpected {} in point input", kind)));
                }
            }
        }

        if let Some((seq, ops)) = merge {
            if is_last_stripe && (self.elide)(user_key, user_key) {
                out.push(self.fold(user_key, seq, None, &ops));
            } else {
                let value = self.merger.fold(user_key, None, ops.iter().rev().map(Vec::as_slice));
                self.stats.merges_folded += ops.len() as u64;
                out.push(InternalKv::inline(
                    InternalKey::new(user_key.to_vec(), seq, InternalKeyKind::Merge),
                    value,
                ));
            }
        }
        Ok(())
    }

    /// A single delete and the set beneath it may both go only when that
    /// set is the one remaining version anywhere.
    fn single_delete_elides(&self, versions: &[InternalKv], idx: usize, s: usize) -> bool {
        let rest = &versions[idx + 1..];
        if rest.len() != 1 {
            return false;
        }
        let older = &rest[0];
        let user_key = older.key.user_key.as_slice();
        older.key.kind() == InternalKeyKind::Set
            && self.stripe(older.key.seq()) == s
            && !self.covered(user_key, older.key.seq())
            && (self.elide)(user_key, user_key)
    }

    fn fold(&mut self, user_key: &[u8], seq: SeqNum, base: Option<&[u8]>, ops: &[Vec<u8>]) -> InternalKv {
        self.stats.merges_folded += ops.len() as u64;
        let value = self.merger.fold(user_key, base, ops.iter().rev().map(Vec::as_slice));
        InternalKv::inline(InternalKey::new(user_key.to_vec(), seq, InternalKeyKind::Set), value)
    }
}

pub(crate) fn stripe(snapshots: &[SeqNum], seq: SeqNum) -> usize {
    snapshots.partition_point(|s| *s < seq)
}

/// Keeps the newest tombstone of every stripe in each fragment, dropping
/// stripe-0 tombstones with nothing beneath them.
fn compact_range_dels(fragments: &[Span], snapshots: &[SeqNum], elide: &ElideFn) -> Vec<Span> {
    let mut out = Vec::new();
    for frag in fragments {
        let mut seen: Option<usize> = None;
        let mut keys: Vec<SpanKey> = Vec::new();
        for k in &frag.keys {
            let s = stripe(snapshots, k.seq());
            if seen == Some(s) {
                continue;
            }
            seen = Some(s);
            if s == 0 && elide(frag.start.as_slice(), frag.end.as_slice()) {
                continue;
            }
            keys.push(k.clone());
        }
        if !keys.is_empty() {
            out.push(Span {
                start: frag.start.clone(),
                end: frag.end.clone(),
                keys,
            });
        }
    }
    out
}

/// Per fragment and stripe: the newest set or unset of each suffix wins
/// and a range key delete hides everything older. At the bottom of the
/// tree unsets and deletes of stripe 0 have nothing left to hide.
fn compact_range_keys(
    cmp: &'static Comparer,
    fragments: Vec<Span>,
    snapshots: &[SeqNum],
    elide: &ElideFn,
) -> Vec<Span> {
    let mut out = Vec::new();
    for frag in fragments {
        let bottom = elide(frag.start.as_slice(), frag.end.as_slice());
        let mut keys: Vec<SpanKey> = Vec::new();
        let mut stripe_of_run: Option<usize> = None;
        let mut seen: Vec<&[u8]> = Vec::new();
        let mut deleted = false;
        for k in &frag.keys {
            let s = stripe(snapshots, k.seq());
            if stripe_of_run != Some(s) {
                stripe_of_run = Some(s);
                seen.clear();
                deleted = false;
            }
            if deleted {
                continue;
            }
            let drop_at_bottom = bottom && s == 0;
            match k.kind() {
                InternalKeyKind::RangeKeyDelete => {
                    deleted = true;
                    if !drop_at_bottom {
                        keys.push(k.clone());
                    }
                }
                InternalKeyKind::RangeKeySet | InternalKeyKind::RangeKeyUnset => {
                    if seen.iter().any(|x| cmp.cmp_suffix(x, &k.suffix) == Ordering::Equal) {
                        continue;
                    }
                    seen.push(&k.suffix);
                    if k.kind() == InternalKeyKind::RangeKeySet || !drop_at_bottom {
                        keys.push(k.clone());
                    }
                }
                _ => {}
            }
        }
        if !keys.is_empty() {
            out.push(Span {
                start: frag.start.clone(),
                end: frag.end.clone(),
                keys,
            });
        }
    }
    defragment(cmp, out, |a, b| a.keys == b.keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::{make_trailer, BlobValue, InternalValue, DEFAULT_COMPARER, DEFAULT_MERGER};

    struct NoBlobs;

    impl ValueFetcher for NoBlobs {
        fn fetch(&self, _: &BlobValue) -> Result<Vec<u8>> {
            Err(invariant("no blobs in this test"))
        }
    }

    /// Forward-only cursor over a fixed list, in the given order.
    struct ListIter {
        kvs: Vec<InternalKv>,
        pos: usize,
    }

    impl InternalIterator for ListIter {
        fn first(&mut self) -> Result<()> {
            self.pos = 0;
            Ok(())
        }
        fn last(&mut self) -> Result<()> {
            self.pos = self.kvs.len().saturating_sub(1);
            Ok(())
        }
        fn seek_ge(&mut self, _: &[u8]) -> Result<()> {
            unimplemented!()
        }
        fn seek_lt(&mut self, _: &[u8]) -> Result<()> {
            unimplemented!()
        }
        fn next(&mut self) -> Result<()> {
            self.pos += 1;
            Ok(())
        }
        fn prev(&mut self) -> Result<()> {
            unimplemented!()
        }
        fn current(&self) -> Option<&InternalKv> {
            self.kvs.get(self.pos)
        }
    }

    fn kv(key: &str, seq: SeqNum, kind: InternalKeyKind, value: &str) -> InternalKv {
        InternalKv::new(
            InternalKey::new(key.as_bytes().to_vec(), seq, kind),
            InternalValue::Inline(value.as_bytes().to_vec()),
        )
    }

    fn range_del(start: &str, end: &str, seq: SeqNum) -> Span {
        Span::new(
            start.as_bytes().to_vec(),
            end.as_bytes().to_vec(),
            vec![SpanKey::new(make_trailer(seq, InternalKeyKind::RangeDelete), vec![], vec![])],
        )
    }

    fn range_key(start: &str, end: &str, seq: SeqNum, kind: InternalKeyKind, suffix: &str, value: &str) -> Span {
        Span::new(
            start.as_bytes().to_vec(),
            end.as_bytes().to_vec(),
            vec![SpanKey::new(make_trailer(seq, kind), suffix.as_bytes().to_vec(), value.as_bytes().to_vec())],
        )
    }

    struct Setup {
        kvs: Vec<InternalKv>,
        snapshots: Vec<SeqNum>,
        range_dels: Vec<Span>,
        range_keys: Vec<Span>,
        bottom: bool,
    }

    impl Setup {
        fn new(kvs: Vec<InternalKv>) -> Self {
            Self {
                kvs,
                snapshots: Vec::new(),
                range_dels: Vec::new(),
                range_keys: Vec::new(),
                bottom: true,
            }
        }

        fn build(self) -> CompactionIter {
            let bottom = self.bottom;
            CompactionIter::new(
                &DEFAULT_COMPARER,
                &DEFAULT_MERGER,
                Arc::new(NoBlobs),
                Box::new(ListIter { kvs: self.kvs, pos: 0 }),
                self.snapshots,
                self.range_dels,
                self.range_keys,
                Box::new(move |_, _| bottom),
            )
        }
    }

    fn render(kv: &InternalKv) -> String {
        let v = match &kv.value {
            InternalValue::Inline(v) => String::from_utf8_lossy(v).into_owned(),
            InternalValue::Blob(_) => "<blob>".into(),
        };
        format!("{}:{}", kv.key, v)
    }

    fn run(mut it: CompactionIter) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(versions) = it.next_user_key()? {
            out.extend(versions.iter().map(render));
        }
        Ok(out)
    }

    // ---- Points without snapshots ----

    #[test]
    fn newest_set_wins() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let out = run(Setup::new(vec![kv("a", 3, Set, "3"), kv("a", 2, Set, "2"), kv("b", 1, Set, "1")]).build())?;
        assert_eq!(out, vec!["a#3,SET:3", "b#1,SET:1"]);
        Ok(())
    }

    #[test]
    fn delete_is_elided_at_the_bottom_only() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let input = vec![kv("a", 2, Delete, ""), kv("a", 1, Set, "x")];
        assert!(run(Setup::new(input.clone()).build())?.is_empty());

        let mut s = Setup::new(input);
        s.bottom = false;
        assert_eq!(run(s.build())?, vec!["a#2,DEL:"]);
        Ok(())
    }

    #[test]
    fn merges_fold_into_a_set() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let input = vec![kv("a", 4, Merge, "c"), kv("a", 3, Merge, "b"), kv("a", 2, Set, "a"), kv("a", 1, Set, "z")];
        assert_eq!(run(Setup::new(input).build())?, vec!["a#4,SET:abc"]);

        let input = vec![kv("a", 3, Merge, "y"), kv("a", 2, Delete, ""), kv("a", 1, Set, "z")];
        assert_eq!(run(Setup::new(input).build())?, vec!["a#3,SET:y"]);
        Ok(())
    }

    #[test]
    fn merges_stay_merges_above_older_data() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("a", 3, Merge, "2"), kv("a", 2, Merge, "1")]);
        s.bottom = false;
        assert_eq!(run(s.build())?, vec!["a#3,MERGE:12"]);

        // nothing below: the operands are the whole history
        let s = Setup::new(vec![kv("a", 3, Merge, "2"), kv("a", 2, Merge, "1")]);
        assert_eq!(run(s.build())?, vec!["a#3,SET:12"]);
        Ok(())
    }

    // ---- Snapshot stripes ----

    #[test]
    fn snapshots_keep_one_version_per_stripe() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![
            kv("a", 9, Set, "9"),
            kv("a", 8, Set, "8"),
            kv("a", 5, Delete, ""),
            kv("a", 4, Set, "4"),
            kv("a", 2, Set, "2"),
        ]);
        s.snapshots = vec![4, 6];
        // stripes: {9,8} -> 2, {5} -> 1, {4,2} -> 0
        assert_eq!(run(s.build())?, vec!["a#9,SET:9", "a#5,DEL:", "a#4,SET:4"]);
        Ok(())
    }

    #[test]
    fn delete_above_a_snapshot_is_kept() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("a", 3, Delete, ""), kv("a", 1, Set, "v")]);
        s.snapshots = vec![2];
        assert_eq!(run(s.build())?, vec!["a#3,DEL:", "a#1,SET:v"]);
        Ok(())
    }

    #[test]
    fn merges_do_not_fold_across_stripes() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("a", 3, Merge, "b"), kv("a", 1, Set, "a")]);
        s.snapshots = vec![2];
        assert_eq!(run(s.build())?, vec!["a#3,MERGE:b", "a#1,SET:a"]);
        Ok(())
    }

    // ---- Single deletes ----

    #[test]
    fn single_delete_elides_with_its_set() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let s = Setup::new(vec![kv("a", 2, SingleDelete, ""), kv("a", 1, Set, "v"), kv("b", 3, Set, "b")]);
        assert_eq!(run(s.build())?, vec!["b#3,SET:b"]);
        Ok(())
    }

    #[test]
    fn lone_single_delete_is_dropped_at_the_bottom() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let s = Setup::new(vec![kv("a", 2, SingleDelete, "")]);
        assert!(run(s.build())?.is_empty());

        let mut s = Setup::new(vec![kv("a", 2, SingleDelete, "")]);
        s.bottom = false;
        assert_eq!(run(s.build())?, vec!["a#2,SINGLEDEL:"]);

        let mut s = Setup::new(vec![kv("a", 2, SingleDelete, "")]);
        s.snapshots = vec![1];
        assert_eq!(run(s.build())?, vec!["a#2,SINGLEDEL:"]);
        Ok(())
    }

    #[test]
    fn single_delete_is_kept_when_not_deterministic() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        // two older versions
        let s = Setup::new(vec![kv("a", 3, SingleDelete, ""), kv("a", 2, Set, "2"), kv("a", 1, Set, "1")]);
        assert_eq!(run(s.build())?, vec!["a#3,SINGLEDEL:"]);

        // something may exist below the output
        let mut s = Setup::new(vec![kv("a", 2, SingleDelete, ""), kv("a", 1, Set, "v")]);
        s.bottom = false;
        assert_eq!(run(s.build())?, vec!["a#2,SINGLEDEL:"]);

        // the set is visible to a snapshot
        let mut s = Setup::new(vec![kv("a", 2, SingleDelete, ""), kv("a", 1, Set, "v")]);
        s.snapshots = vec![1];
        assert_eq!(run(s.build())?, vec!["a#2,SINGLEDEL:", "a#1,SET:v"]);

        // the older version is a merge
        let s = Setup::new(vec![kv("a", 2, SingleDelete, ""), kv("a", 1, Merge, "m")]);
        assert_eq!(run(s.build())?, vec!["a#2,SINGLEDEL:"]);
        Ok(())
    }

    // ---- Range deletions ----

    #[test]
    fn range_deletion_shadows_older_points_in_its_stripe() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("b", 1, Set, "b"), kv("c", 2, Set, "c"), kv("d", 4, Set, "d")]);
        s.range_dels = vec![range_del("c", "z", 3)];
        s.bottom = false;
        let it = s.build();
        assert_eq!(it.range_dels().len(), 1);
        assert_eq!(run(it)?, vec!["b#1,SET:b", "d#4,SET:d"]);
        Ok(())
    }

    #[test]
    fn range_deletion_is_elided_at_the_bottom_but_still_shadows() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("c", 2, Set, "c")]);
        s.range_dels = vec![range_del("a", "e", 3)];
        let it = s.build();
        assert!(it.range_dels().is_empty());
        assert!(run(it)?.is_empty());
        Ok(())
    }

    #[test]
    fn range_deletion_below_a_snapshot_does_not_shadow_newer_stripe() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(vec![kv("c", 2, Set, "c")]);
        s.range_dels = vec![range_del("a", "e", 3)];
        s.snapshots = vec![2];
        let it = s.build();
        // the snapshot at 2 still sees c
        assert_eq!(it.range_dels().len(), 1);
        assert_eq!(run(it)?, vec!["c#2,SET:c"]);
        Ok(())
    }

    #[test]
    fn newest_tombstone_per_stripe_survives() -> anyhow::Result<()> {
        let mut s = Setup::new(Vec::new());
        s.range_dels = vec![range_del("a", "c", 5), range_del("a", "c", 4), range_del("a", "c", 2)];
        s.snapshots = vec![3];
        s.bottom = false;
        let it = s.build();
        let seqs: Vec<SeqNum> = it.range_dels()[0].keys.iter().map(SpanKey::seq).collect();
        assert_eq!(seqs, vec![5, 2]);
        Ok(())
    }

    // ---- Range keys ----

    #[test]
    fn range_key_delete_clears_older_keys_and_defragments() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(Vec::new());
        s.range_keys = vec![
            range_key("a", "c", 1, RangeKeySet, "@2", "foo"),
            range_key("c", "e", 2, RangeKeySet, "@3", "bar"),
            range_key("b", "d", 3, RangeKeyDelete, "", ""),
        ];
        let it = s.build();
        let spans: Vec<String> = it.range_keys().iter().map(|s| format!("{:?}", s)).collect();
        assert_eq!(spans, vec!["[a-b):[#1,RANGEKEYSET @2=foo]", "[d-e):[#2,RANGEKEYSET @3=bar]"]);
        Ok(())
    }

    #[test]
    fn abutting_identical_range_keys_merge() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(Vec::new());
        s.range_keys = vec![
            range_key("a", "b", 1, RangeKeySet, "@1", "v"),
            range_key("b", "d", 1, RangeKeySet, "@1", "v"),
        ];
        let it = s.build();
        assert_eq!(it.range_keys().len(), 1);
        assert_eq!(it.range_keys()[0].start, b"a");
        assert_eq!(it.range_keys()[0].end, b"d");
        Ok(())
    }

    #[test]
    fn unsets_survive_above_older_data() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut s = Setup::new(Vec::new());
        s.range_keys = vec![
            range_key("a", "c", 2, RangeKeyUnset, "@1", ""),
            range_key("a", "c", 1, RangeKeySet, "@1", "v"),
        ];
        s.bottom = false;
        let it = s.build();
        assert_eq!(it.range_keys()[0].keys.len(), 1);
        assert_eq!(it.range_keys()[0].keys[0].kind(), RangeKeyUnset);

        let mut s = Setup::new(Vec::new());
        s.range_keys = vec![
            range_key("a", "c", 2, RangeKeyUnset, "@1", ""),
            range_key("a", "c", 1, RangeKeySet, "@1", "v"),
        ];
        s.bottom = true;
        assert!(s.build().range_keys().is_empty());
        Ok(())
    }

    // ---- Invariants ----

    #[test]
    fn out_of_order_input_is_an_invariant_violation() -> anyhow::Result<()> {
        use InternalKeyKind::*;
        let mut it = Setup::new(vec![kv("b", 1, Set, "b"), kv("a", 2, Set, "a")]).build();
        let err = loop {
            match it.next_user_key() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("out-of-order input accepted"),
                Err(e) => break e,
            }
        };
        assert!(matches!(base::classify(&err), Some(base::Error::Invariant(_))));
        Ok(())
    }

    #[test]
    fn stripe_counts_snapshots_below() {
        let snaps = [5, 9];
        assert_eq!(stripe(&snaps, 1), 0);
        assert_eq!(stripe(&snaps, 5), 0);
        assert_eq!(stripe(&snaps, 6), 1);
        assert_eq!(stripe(&snaps, 9), 1);
        assert_eq!(stripe(&snaps, 10), 2);
    }
}
