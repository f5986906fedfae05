use std::cmp::Ordering;
use std::fmt;

use crate::key::InternalKey;

type CompareFn = fn(&[u8], &[u8]) -> Ordering;
type SplitFn = fn(&[u8]) -> usize;

/// User key ordering injected into every component.
///
/// A comparer is a set of pure functions. `split` returns the length of
/// the key's prefix; the remaining bytes are its suffix (for example an
/// MVCC version), which `compare_suffixes` orders on its own.
pub struct Comparer {
    /// Persisted in the manifest; reopening with a different comparer is
    /// rejected.
    pub name: &'static str,
    pub compare: CompareFn,
    pub split: SplitFn,
    pub compare_suffixes: CompareFn,
}

impl Comparer {
    #[inline]
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    #[inline]
    pub fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }

    /// User key ascending, then trailer descending.
    #[inline]
    pub fn cmp_internal(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.cmp(&a.user_key, &b.user_key)
            .then_with(|| b.trailer.cmp(&a.trailer))
    }

    #[inline]
    pub fn cmp_suffix(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare_suffixes)(a, b)
    }

    pub fn prefix<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        &key[..(self.split)(key)]
    }

    pub fn suffix<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        &key[(self.split)(key)..]
    }

    /// The larger of two user keys.
    pub fn max<'a>(&self, a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
        if self.cmp(a, b) == Ordering::Less {
            b
        } else {
            a
        }
    }

    /// The smaller of two user keys.
    pub fn min<'a>(&self, a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
        if self.cmp(a, b) == Ordering::Greater {
            b
        } else {
            a
        }
    }
}

impl fmt::Debug for Comparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparer").field("name", &self.name).finish()
    }
}

fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

fn whole_key(key: &[u8]) -> usize {
    key.len()
}

/// Lexicographic byte order; every key is its own prefix.
pub static DEFAULT_COMPARER: Comparer = Comparer {
    name: "shoal.BytewiseComparator",
    compare: bytewise,
    split: whole_key,
    compare_suffixes: bytewise,
};

fn split_at_version(key: &[u8]) -> usize {
    key.iter().rposition(|&b| b == b'@').unwrap_or(key.len())
}

fn parse_version(suffix: &[u8]) -> Option<u64> {
    std::str::from_utf8(suffix.strip_prefix(b"@")?)
        .ok()?
        .parse()
        .ok()
}

fn compare_versions(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (parse_version(a), parse_version(b)) {
        // Newer versions sort first.
        (Some(va), Some(vb)) => vb.cmp(&va),
        _ => a.cmp(b),
    }
}

fn compare_versioned(a: &[u8], b: &[u8]) -> Ordering {
    let (pa, sa) = a.split_at(split_at_version(a));
    let (pb, sb) = b.split_at(split_at_version(b));
    pa.cmp(pb).then_with(|| compare_versions(sa, sb))
}

/// Keys of the form `prefix@<version>`.
///
/// Prefixes compare bytewise. Versions are decimal and sort descending, so
/// `k@10` comes before `k@9`; a bare `k` sorts before any of its versions.
pub static VERSIONED_COMPARER: Comparer = Comparer {
    name: "shoal.VersionedComparer",
    compare: compare_versioned,
    split: split_at_version,
    compare_suffixes: compare_versions,
};

/// Folds one merge operand onto an existing value (`None` when the key has
/// no older value).
pub type MergeFn = fn(key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8>;

/// Derives a one-byte summary of a separated value, stored next to its blob
/// handle.
pub type ShortAttributeExtractor = fn(key: &[u8], prefix_len: usize, value: &[u8]) -> u8;

/// The injected merge operator.
pub struct Merger {
    pub name: &'static str,
    pub merge: MergeFn,
}

impl Merger {
    /// Applies `operands` (ordered oldest first) on top of `base`.
    pub fn fold<'a>(
        &self,
        key: &[u8],
        base: Option<&[u8]>,
        operands: impl IntoIterator<Item = &'a [u8]>,
    ) -> Vec<u8> {
        let mut acc: Option<Vec<u8>> = base.map(<[u8]>::to_vec);
        for op in operands {
            acc = Some((self.merge)(key, acc.as_deref(), op));
        }
        acc.unwrap_or_default()
    }
}

impl fmt::Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger").field("name", &self.name).finish()
    }
}

fn concatenate(_key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
    out.extend_from_slice(operand);
    out
}

/// Appends each operand to the existing value.
pub static DEFAULT_MERGER: Merger = Merger {
    name: "shoal.concatenate",
    merge: concatenate,
};
