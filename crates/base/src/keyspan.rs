//! Key spans: range deletions and range keys.
//!
//! A [`Span`] covers `[start, end)` and carries every [`SpanKey`] that
//! applies to that range, newest first. Writers produce one span per
//! operation; readers and compactions call [`fragment`] to turn an
//! arbitrary set of possibly-overlapping spans into sorted, disjoint
//! fragments:
//!
//! ```text
//! input:      [a-----------e)#5
//!                  [c-----------g)#7
//!
//! fragments:  [a---c)#5
//!                  [c--e)#7,#5
//!                       [e--g)#7
//! ```

use std::cmp::Ordering;
use std::fmt;

use crate::comparer::Comparer;
use crate::encoding::{put_length_prefixed, put_uvarint, Decoder};
use crate::error::corruption;
use crate::key::{trailer_kind, trailer_seq, InternalKeyKind, SeqNum};

/// One key within a span.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SpanKey {
    pub trailer: u64,
    /// Range keys only; empty for range deletions.
    pub suffix: Vec<u8>,
    /// Range key sets only.
    pub value: Vec<u8>,
}

impl SpanKey {
    pub fn new(trailer: u64, suffix: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            trailer,
            suffix: suffix.into(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn seq(&self) -> SeqNum {
        trailer_seq(self.trailer)
    }

    #[inline]
    pub fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }
}

impl fmt::Debug for SpanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{},{}", self.seq(), self.kind())?;
        if !self.suffix.is_empty() {
            write!(f, " {}", String::from_utf8_lossy(&self.suffix))?;
        }
        if !self.value.is_empty() {
            write!(f, "={}", String::from_utf8_lossy(&self.value))?;
        }
        Ok(())
    }
}

/// The range `[start, end)` and the keys applying to it, sorted by trailer
/// descending.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub keys: Vec<SpanKey>,
}

impl Span {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>, mut keys: Vec<SpanKey>) -> Self {
        keys.sort_by(|a, b| b.trailer.cmp(&a.trailer));
        Self {
            start: start.into(),
            end: end.into(),
            keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, cmp: &Comparer, key: &[u8]) -> bool {
        cmp.cmp(&self.start, key) != Ordering::Greater && cmp.cmp(key, &self.end) == Ordering::Less
    }

    pub fn largest_seq(&self) -> SeqNum {
        self.keys.first().map(SpanKey::seq).unwrap_or(0)
    }

    pub fn smallest_seq(&self) -> SeqNum {
        self.keys.last().map(SpanKey::seq).unwrap_or(0)
    }

    /// A copy holding only the keys visible at `seq`.
    pub fn visible(&self, seq: SeqNum) -> Span {
        Span {
            start: self.start.clone(),
            end: self.end.clone(),
            keys: self
                .keys
                .iter()
                .filter(|k| k.seq() <= seq)
                .cloned()
                .collect(),
        }
    }

    /// True if a range deletion in this span shadows a point written at
    /// `seq` for a reader at `snapshot`.
    pub fn deletes(&self, seq: SeqNum, snapshot: SeqNum) -> bool {
        self.keys.iter().any(|k| {
            k.kind() == InternalKeyKind::RangeDelete && k.seq() > seq && k.seq() <= snapshot
        })
    }

    /// Encodes the span as a block entry: the key is `start`, the value is
    /// `end` followed by the keys.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length_prefixed(&mut buf, &self.end);
        put_uvarint(&mut buf, self.keys.len() as u64);
        for k in &self.keys {
            buf.extend_from_slice(&k.trailer.to_le_bytes());
            put_length_prefixed(&mut buf, &k.suffix);
            put_length_prefixed(&mut buf, &k.value);
        }
        buf
    }

    /// Inverse of [`Span::encode_value`].
    pub fn decode(start: &[u8], value: &[u8]) -> anyhow::Result<Span> {
        let mut d = Decoder::new(value);
        let end = d.length_prefixed()?.to_vec();
        let n = d.uvarint()? as usize;
        let mut keys = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            let trailer = d.u64_le()?;
            if InternalKeyKind::from_u8((trailer & 0xff) as u8).is_none() {
                return Err(corruption(format!("unknown span key kind {}", trailer & 0xff)));
            }
            let suffix = d.length_prefixed()?.to_vec();
            let value = d.length_prefixed()?.to_vec();
            keys.push(SpanKey {
                trailer,
                suffix,
                value,
            });
        }
        if !d.is_empty() {
            return Err(corruption("trailing bytes after span"));
        }
        Ok(Span::new(start.to_vec(), end, keys))
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}-{}):{:?}",
            String::from_utf8_lossy(&self.start),
            String::from_utf8_lossy(&self.end),
            self.keys
        )
    }
}

/// Splits `spans` at every start and end boundary so that the result is
/// sorted and non-overlapping. Each fragment carries the keys of every
/// input span covering it; exact duplicate keys are collapsed. Empty
/// input spans and `start >= end` spans are ignored.
pub fn fragment(cmp: &Comparer, spans: impl IntoIterator<Item = Span>) -> Vec<Span> {
    let spans: Vec<Span> = spans
        .into_iter()
        .filter(|s| !s.keys.is_empty() && cmp.cmp(&s.start, &s.end) == Ordering::Less)
        .collect();
    if spans.is_empty() {
        return Vec::new();
    }

    let mut bounds: Vec<&[u8]> = Vec::with_capacity(spans.len() * 2);
    for s in &spans {
        bounds.push(&s.start);
        bounds.push(&s.end);
    }
    bounds.sort_by(|a, b| cmp.cmp(a, b));
    bounds.dedup_by(|a, b| cmp.equal(a, b));

    let mut buckets: Vec<Vec<SpanKey>> = vec![Vec::new(); bounds.len() - 1];
    for s in &spans {
        let lo = bounds.partition_point(|b| cmp.cmp(b, &s.start) == Ordering::Less);
        let hi = bounds.partition_point(|b| cmp.cmp(b, &s.end) == Ordering::Less);
        for bucket in &mut buckets[lo..hi] {
            bucket.extend(s.keys.iter().cloned());
        }
    }

    let mut out = Vec::new();
    for (i, mut keys) in buckets.into_iter().enumerate() {
        if keys.is_empty() {
            continue;
        }
        keys.sort_by(|a, b| {
            b.trailer
                .cmp(&a.trailer)
                .then_with(|| a.suffix.cmp(&b.suffix))
                .then_with(|| a.value.cmp(&b.value))
        });
        keys.dedup();
        out.push(Span {
            start: bounds[i].to_vec(),
            end: bounds[i + 1].to_vec(),
            keys,
        });
    }
    out
}

/// Merges abutting spans for which `same` holds. Spans must be sorted and
/// non-overlapping.
pub fn defragment(
    cmp: &Comparer,
    spans: impl IntoIterator<Item = Span>,
    same: impl Fn(&Span, &Span) -> bool,
) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::new();
    for span in spans {
        if let Some(last) = out.last_mut() {
            if cmp.equal(&last.end, &span.start) && same(last, &span) {
                last.end = span.end;
                continue;
            }
        }
        out.push(span);
    }
    out
}

/// Resolves the visible keys of one range-key fragment into the set of
/// live `(suffix, value)` pairs, sorted by suffix.
///
/// `keys` must already be filtered to the reader's sequence number and
/// sorted newest first. The newest set or unset of each suffix wins, a
/// range key delete hides everything older, and unsets are not reported.
pub fn coalesce_range_keys(cmp: &Comparer, keys: &[SpanKey]) -> Vec<SpanKey> {
    let mut seen: Vec<&[u8]> = Vec::new();
    let mut out = Vec::new();
    for k in keys {
        match k.kind() {
            InternalKeyKind::RangeKeyDelete => break,
            InternalKeyKind::RangeKeySet | InternalKeyKind::RangeKeyUnset => {
                if seen.iter().any(|s| cmp.cmp_suffix(s, &k.suffix) == Ordering::Equal) {
                    continue;
                }
                seen.push(&k.suffix);
                if k.kind() == InternalKeyKind::RangeKeySet {
                    out.push(k.clone());
                }
            }
            _ => {}
        }
    }
    out.sort_by(|a, b| cmp.cmp_suffix(&a.suffix, &b.suffix));
    out
}

/// Index of the span in the sorted slice `spans` that contains `key`.
pub fn find_containing(cmp: &Comparer, spans: &[Span], key: &[u8]) -> Option<usize> {
    let i = spans.partition_point(|s| cmp.cmp(&s.start, key) != Ordering::Greater);
    if i == 0 {
        return None;
    }
    let span = &spans[i - 1];
    (cmp.cmp(key, &span.end) == Ordering::Less).then_some(i - 1)
}
