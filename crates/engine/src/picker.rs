//! Choosing what to compact next.
//!
//! Each level gets a score: L0 by file count against
//! `l0_compaction_threshold`, deeper levels by compensated size against a
//! target that grows by `level_multiplier` per level. The highest score of
//! at least 1.0 wins, and its inputs are chosen so that the output level
//! stays sorted:
//!
//! ```text
//! L0:   every L0 file ─────────────────┐
//! Ln:   next file after the pointer,   ├─► + overlapping files of Ln+1
//!       grown to its atomic unit ──────┘   (+ expansion, move, multi-level)
//! ```

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use base::Comparer;
use config::Options;
use tracing::{debug, trace};

use crate::compaction::{Compaction, CompactionKind, CompactionState, LevelInputs};
use crate::file_metadata::FileMetadata;
use crate::version::{Version, NUM_LEVELS};

/// Target size of `level`; L0 has none and is scored by file count.
pub fn level_target(opts: &Options, level: usize) -> u64 {
    let mut target = opts.lbase_max_bytes;
    for _ in 1..level {
        target = target.saturating_mul(opts.level_multiplier);
    }
    target
}

/// Compaction scores of every level that has a level below it.
pub fn level_scores(version: &Version, opts: &Options) -> Vec<(usize, f64)> {
    let mut scores = Vec::with_capacity(NUM_LEVELS - 1);
    let l0 = version.files(0).iter().filter(|f| !f.is_compacting()).count();
    scores.push((0, l0 as f64 / opts.l0_compaction_threshold as f64));
    for level in 1..NUM_LEVELS - 1 {
        let size: u64 = version
            .files(level)
            .iter()
            .filter(|f| !f.is_compacting())
            .map(|f| f.compensated_size())
            .sum();
        scores.push((level, size as f64 / level_target(opts, level) as f64));
    }
    scores
}

/// Inclusive user key bounds of `files`.
fn key_range(cmp: &Comparer, files: &[Arc<FileMetadata>]) -> Option<(Vec<u8>, Vec<u8>)> {
    let first = files.first()?;
    let mut lo = first.smallest.user_key.as_slice();
    let mut hi = first.largest.user_key.as_slice();
    for f in &files[1..] {
        lo = cmp.min(lo, &f.smallest.user_key);
        hi = cmp.max(hi, &f.largest.user_key);
    }
    Some((lo.to_vec(), hi.to_vec()))
}

fn union_range(cmp: &Comparer, inputs: &[LevelInputs]) -> Option<(Vec<u8>, Vec<u8>)> {
    let all: Vec<Arc<FileMetadata>> = inputs.iter().flat_map(|l| l.files.iter().cloned()).collect();
    key_range(cmp, &all)
}

fn any_compacting(files: &[Arc<FileMetadata>]) -> bool {
    files.iter().any(|f| f.is_compacting())
}

fn total_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Grows `files[lo..=hi]` of a sorted level so that no user key is split
/// between the selection and a neighbour.
fn atomic_unit(cmp: &Comparer, files: &[Arc<FileMetadata>], mut lo: usize, mut hi: usize) -> (usize, usize) {
    let joined = |a: &FileMetadata, b: &FileMetadata| {
        !a.largest_is_exclusive() && cmp.equal(&a.largest.user_key, &b.smallest.user_key)
    };
    while lo > 0 && joined(&files[lo - 1], &files[lo]) {
        lo -= 1;
    }
    while hi + 1 < files.len() && joined(&files[hi], &files[hi + 1]) {
        hi += 1;
    }
    (lo, hi)
}

/// Positions of the first and last of `picked` within `level_files`.
fn positions(level_files: &[Arc<FileMetadata>], picked: &[Arc<FileMetadata>]) -> Option<(usize, usize)> {
    let first = picked.first()?.file_num;
    let last = picked.last()?.file_num;
    let lo = level_files.iter().position(|f| f.file_num == first)?;
    let hi = level_files.iter().position(|f| f.file_num == last)?;
    Some((lo, hi))
}

/// Registers `c` unless it collides with a running compaction.
fn try_register(st: &mut CompactionState, cmp: &Comparer, mut c: Compaction) -> Option<Compaction> {
    if st.conflicts(cmp, &c) {
        trace!(level = c.start_level(), "candidate conflicts with a running compaction");
        return None;
    }
    c.id = st.next_id();
    st.register(&c);
    Some(c)
}

/// A compaction of `start` into the level below, not yet registered.
fn build(
    version: &Version,
    opts: &Options,
    kind: CompactionKind,
    start: LevelInputs,
    score: f64,
) -> Option<Compaction> {
    let cmp = version.comparer();
    let output_level = start.level + 1;
    let (lo, hi) = key_range(cmp, &start.files)?;
    let outputs = version.overlapping(output_level, &lo, &hi);
    if any_compacting(&outputs) {
        return None;
    }
    let mut inputs = vec![start, LevelInputs::new(output_level, outputs)];
    if kind != CompactionKind::Manual {
        expand_start_level(version, opts, &mut inputs);
    }
    let (smallest, largest) = union_range(cmp, &inputs)?;
    let mut c = Compaction {
        id: 0,
        kind,
        inputs,
        output_level,
        grandparents: Vec::new(),
        smallest,
        largest,
        score,
        cancel: Arc::new(AtomicBool::new(false)),
    };
    if kind == CompactionKind::Default && opts.multilevel_compactions {
        extend_multi_level(version, opts, &mut c);
    }
    if c.output_level + 1 < NUM_LEVELS {
        c.grandparents = version.overlapping(c.output_level + 1, &c.smallest, &c.largest);
    }
    if c.kind == CompactionKind::Default
        && c.inputs.len() == 2
        && c.inputs[0].files.len() == 1
        && c.inputs[1].files.is_empty()
        && c.grandparent_bytes() <= opts.max_grandparent_overlap_factor * opts.target_file_size
    {
        c.kind = CompactionKind::Move;
    }
    Some(c)
}

/// Pulls more start-level files into the compaction when that does not
/// add output-level files and the total stays under the expansion limit.
fn expand_start_level(version: &Version, opts: &Options, inputs: &mut [LevelInputs]) {
    let level = inputs[0].level;
    if level == 0 || inputs[1].files.is_empty() {
        return;
    }
    let cmp = version.comparer();
    let Some((lo, hi)) = union_range(cmp, inputs) else {
        return;
    };
    let level_files = version.files(level);
    let grown = version.overlapping(level, &lo, &hi);
    let Some((a, b)) = positions(level_files, &grown) else {
        return;
    };
    let (a, b) = atomic_unit(cmp, level_files, a, b);
    let grown: Vec<Arc<FileMetadata>> = level_files[a..=b].to_vec();
    if grown.len() <= inputs[0].files.len() || any_compacting(&grown) {
        return;
    }
    let Some((glo, ghi)) = key_range(cmp, &grown) else {
        return;
    };
    let outputs = version.overlapping(level + 1, &glo, &ghi);
    let limit = opts.expanded_compaction_factor * opts.target_file_size;
    if outputs.len() != inputs[1].files.len() || total_size(&grown) + total_size(&outputs) >= limit {
        return;
    }
    debug!(level, from = inputs[0].files.len(), to = grown.len(), "expanded compaction inputs");
    inputs[0].files = grown;
}

/// Adds the level below the output when the output level would overflow
/// its target anyway.
fn extend_multi_level(version: &Version, opts: &Options, c: &mut Compaction) {
    let out = c.output_level;
    if out + 1 >= NUM_LEVELS || c.inputs[1].files.is_empty() {
        return;
    }
    if version.level_size(out) + c.inputs[0].size() <= level_target(opts, out) {
        return;
    }
    let below = version.overlapping(out + 1, &c.smallest, &c.largest);
    if any_compacting(&below) {
        return;
    }
    let limit = 2 * opts.expanded_compaction_factor * opts.target_file_size;
    if c.input_bytes() + total_size(&below) >= limit {
        return;
    }
    c.inputs.push(LevelInputs::new(out + 1, below));
    c.output_level = out + 1;
    c.kind = CompactionKind::MultiLevel;
    if let Some((lo, hi)) = union_range(version.comparer(), &c.inputs) {
        c.smallest = lo;
        c.largest = hi;
    }
}

/// Candidate start files of sorted `level`, round-robin from the pointer.
fn pick_start_file(
    version: &Version,
    level: usize,
    pointer: Option<&[u8]>,
) -> Vec<(usize, usize)> {
    let cmp = version.comparer();
    let files = version.files(level);
    let begin = pointer.map_or(0, |p| {
        files.partition_point(|f| cmp.cmp(&f.smallest.user_key, p) != Ordering::Greater)
    });
    (begin..files.len())
        .chain(0..begin)
        .filter(|&i| !files[i].is_compacting())
        .map(|i| atomic_unit(cmp, files, i, i))
        .collect()
}

/// Picks and registers the most urgent compaction, if any is needed.
pub(crate) fn pick_auto(version: &Arc<Version>, opts: &Options, st: &mut CompactionState) -> Option<Compaction> {
    let cmp = version.comparer();
    let mut scores = level_scores(version, opts);
    // highest score first; ties go to the shallower level
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    for (level, score) in scores {
        if score < 1.0 {
            break;
        }
        if level == 0 {
            let files = version.files(0).to_vec();
            if files.is_empty() || any_compacting(&files) {
                continue;
            }
            if let Some(c) = build(version, opts, CompactionKind::Default, LevelInputs::new(0, files), score) {
                if let Some(c) = try_register(st, cmp, c) {
                    return Some(c);
                }
            }
            continue;
        }
        for (lo, hi) in pick_start_file(version, level, st.pointer(level)) {
            let unit = version.files(level)[lo..=hi].to_vec();
            if any_compacting(&unit) {
                continue;
            }
            let Some(c) = build(version, opts, CompactionKind::Default, LevelInputs::new(level, unit), score) else {
                continue;
            };
            if let Some(c) = try_register(st, cmp, c) {
                return Some(c);
            }
        }
    }
    None
}

pub(crate) enum ManualPick {
    Picked(Compaction),
    /// No files of the level overlap the range.
    Nothing,
    /// The inputs are busy; retry once a running compaction finishes.
    Conflict,
}

/// Picks a compaction of the files of `level` overlapping
/// `[start, end]` into the level below.
pub(crate) fn pick_manual(
    version: &Arc<Version>,
    opts: &Options,
    st: &mut CompactionState,
    level: usize,
    start: &[u8],
    end: &[u8],
) -> ManualPick {
    let cmp = version.comparer();
    let mut files = version.overlapping(level, start, end);
    if files.is_empty() {
        return ManualPick::Nothing;
    }
    if level > 0 {
        let level_files = version.files(level);
        if let Some((a, b)) = positions(level_files, &files) {
            let (a, b) = atomic_unit(cmp, level_files, a, b);
            files = level_files[a..=b].to_vec();
        }
    }
    if any_compacting(&files) {
        return ManualPick::Conflict;
    }
    match build(version, opts, CompactionKind::Manual, LevelInputs::new(level, files), 0.0) {
        Some(c) => match try_register(st, cmp, c) {
            Some(c) => ManualPick::Picked(c),
            None => ManualPick::Conflict,
        },
        None => ManualPick::Conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_metadata::FileBacking;
    use crate::version_edit::VersionParts;
    use base::{InternalKey, InternalKeyKind, DEFAULT_COMPARER};
    use std::collections::BTreeMap;

    fn file(num: u64, lo: &str, hi: &str, size: u64) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            num,
            size,
            InternalKey::new(lo, num, InternalKeyKind::Set),
            InternalKey::new(hi, num, InternalKeyKind::Set),
            num,
            num,
            FileBacking::new(num, size),
            false,
        ))
    }

    fn version(levels: Vec<(usize, Arc<FileMetadata>)>) -> Arc<Version> {
        let mut parts = VersionParts {
            levels: Default::default(),
            blob_files: BTreeMap::new(),
        };
        for (level, f) in levels {
            parts.levels[level].push(f);
        }
        Arc::new(Version::from_parts(parts, &DEFAULT_COMPARER, None))
    }

    fn small_opts() -> Options {
        Options {
            l0_compaction_threshold: 2,
            lbase_max_bytes: 1000,
            target_file_size: 100,
            ..Options::default()
        }
    }

    fn nums(files: &[Arc<FileMetadata>]) -> Vec<u64> {
        files.iter().map(|f| f.file_num).collect()
    }

    #[test]
    fn level_targets_grow_by_multiplier() {
        let opts = small_opts();
        assert_eq!(level_target(&opts, 1), 1000);
        assert_eq!(level_target(&opts, 2), 10_000);
        assert_eq!(level_target(&opts, 4), 1_000_000);
    }

    #[test]
    fn nothing_to_do_below_threshold() {
        let v = version(vec![(0, file(1, "a", "c", 10))]);
        let mut st = CompactionState::default();
        assert!(pick_auto(&v, &small_opts(), &mut st).is_none());
    }

    #[test]
    fn l0_compacts_all_files_with_overlapping_l1() {
        let v = version(vec![
            (0, file(5, "b", "d", 10)),
            (0, file(6, "c", "f", 10)),
            (1, file(2, "a", "b", 10)),
            (1, file(3, "e", "g", 10)),
            (1, file(4, "x", "z", 10)),
        ]);
        let mut st = CompactionState::default();
        let c = pick_auto(&v, &small_opts(), &mut st).expect("l0 compaction");
        assert_eq!(c.output_level, 1);
        assert_eq!(nums(&c.inputs[0].files), vec![5, 6]);
        assert_eq!(nums(&c.inputs[1].files), vec![2, 3]);
        assert_eq!(c.smallest, b"a");
        assert_eq!(c.largest, b"g");
        assert!(v.files(0).iter().all(|f| f.is_compacting()));
        // everything eligible is busy now
        assert!(pick_auto(&v, &small_opts(), &mut st).is_none());
        st.unregister(&c);
    }

    #[test]
    fn single_file_without_overlap_is_moved() {
        let v = version(vec![(0, file(5, "b", "d", 10)), (0, file(6, "x", "y", 10))]);
        let mut opts = small_opts();
        opts.l0_compaction_threshold = 1;
        let v2 = version(vec![(1, file(7, "a", "c", 5000))]);
        let mut st = CompactionState::default();
        let c = pick_auto(&v2, &opts, &mut st).expect("l1 over target");
        assert_eq!(c.kind, CompactionKind::Move);
        assert_eq!(c.output_level, 2);
        st.unregister(&c);
        // two l0 files are rewritten even without l1 overlap
        let c = pick_auto(&v, &opts, &mut st).expect("l0 compaction");
        assert_eq!(c.kind, CompactionKind::Default);
    }

    #[test]
    fn round_robin_pointer_advances() {
        let v = version(vec![
            (1, file(1, "a", "b", 800)),
            (1, file(2, "c", "d", 800)),
            (2, file(3, "a", "a", 10)),
            (2, file(4, "c", "c", 10)),
        ]);
        let opts = small_opts();
        let mut st = CompactionState::default();
        let c = pick_auto(&v, &opts, &mut st).expect("first");
        assert_eq!(nums(&c.inputs[0].files), vec![1]);
        st.unregister(&c);
        let c = pick_auto(&v, &opts, &mut st).expect("second");
        assert_eq!(nums(&c.inputs[0].files), vec![2]);
        st.unregister(&c);
        let c = pick_auto(&v, &opts, &mut st).expect("wraps");
        assert_eq!(nums(&c.inputs[0].files), vec![1]);
    }

    #[test]
    fn atomic_units_are_not_split() {
        let files = vec![
            file(1, "a", "c", 1),
            file(2, "c", "e", 1),
            file(3, "f", "g", 1),
        ];
        assert_eq!(atomic_unit(&DEFAULT_COMPARER, &files, 1, 1), (0, 1));
        assert_eq!(atomic_unit(&DEFAULT_COMPARER, &files, 2, 2), (2, 2));
    }

    #[test]
    fn start_level_expands_without_new_outputs() {
        let v = version(vec![
            (1, file(1, "a", "b", 600)),
            (1, file(2, "c", "d", 600)),
            (2, file(3, "a", "d", 10)),
        ]);
        let mut opts = small_opts();
        opts.expanded_compaction_factor = 100;
        let mut st = CompactionState::default();
        let c = pick_auto(&v, &opts, &mut st).expect("compaction");
        assert_eq!(nums(&c.inputs[0].files), vec![1, 2]);
        assert_eq!(nums(&c.inputs[1].files), vec![3]);
    }

    #[test]
    fn multi_level_when_output_overflows() {
        let v = version(vec![
            (1, file(1, "a", "d", 1500)),
            (2, file(2, "a", "b", 9000)),
            (2, file(3, "c", "d", 2000)),
            (3, file(4, "a", "z", 10)),
        ]);
        let mut opts = small_opts();
        opts.multilevel_compactions = true;
        opts.expanded_compaction_factor = 1000;
        let mut st = CompactionState::default();
        let c = pick_auto(&v, &opts, &mut st).expect("compaction");
        assert_eq!(c.kind, CompactionKind::MultiLevel);
        assert_eq!(c.output_level, 3);
        assert_eq!(c.inputs.len(), 3);
        assert_eq!(nums(&c.inputs[2].files), vec![4]);
    }

    #[test]
    fn manual_pick_reports_conflicts() {
        let v = version(vec![(1, file(1, "a", "c", 10)), (2, file(2, "b", "d", 10))]);
        let opts = small_opts();
        let mut st = CompactionState::default();
        assert!(matches!(pick_manual(&v, &opts, &mut st, 3, b"a", b"z"), ManualPick::Nothing));
        let ManualPick::Picked(c) = pick_manual(&v, &opts, &mut st, 1, b"a", b"z") else {
            panic!("expected a manual compaction");
        };
        assert_eq!(c.kind, CompactionKind::Manual);
        assert!(matches!(pick_manual(&v, &opts, &mut st, 1, b"a", b"z"), ManualPick::Conflict));
        st.unregister(&c);
    }
}
