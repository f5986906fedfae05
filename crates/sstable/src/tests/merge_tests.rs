use anyhow::Result;
use base::{InternalIterator, InternalKeyKind, DEFAULT_COMPARER};
use tempfile::tempdir;

use super::{collect_backward, collect_forward, ikey, render, set, write_table};
use crate::*;

/// Three overlapping tables, newest data in the last one.
fn build(store: &FsObjectStore) -> Result<MergingIter> {
    let (_, t1) = write_table(
        store,
        "000001.sst",
        &[(set("a", 1), "a1"), (set("c", 2), "c2"), (set("e", 3), "e3")],
        64,
    )?;
    let (_, t2) = write_table(
        store,
        "000002.sst",
        &[(set("b", 4), "b4"), (set("c", 5), "c5"), (set("f", 6), "f6")],
        64,
    )?;
    let (_, t3) = write_table(
        store,
        "000003.sst",
        &[(ikey("c", 7, InternalKeyKind::Delete), ""), (set("d", 8), "d8")],
        64,
    )?;
    let children: Vec<Box<dyn InternalIterator>> = vec![
        Box::new(t1.iter(TableIterOptions::default())),
        Box::new(t2.iter(TableIterOptions::default())),
        Box::new(t3.iter(TableIterOptions::default())),
    ];
    Ok(MergingIter::new(&DEFAULT_COMPARER, children))
}

fn expected() -> Vec<&'static str> {
    vec![
        "a#1,SET=a1",
        "b#4,SET=b4",
        "c#7,DEL=",
        "c#5,SET=c5",
        "c#2,SET=c2",
        "d#8,SET=d8",
        "e#3,SET=e3",
        "f#6,SET=f6",
    ]
}

#[test]
fn yields_every_version_in_order() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut it = build(&store)?;
    assert_eq!(it.num_children(), 3);
    assert_eq!(collect_forward(&mut it)?, expected());

    let mut rev: Vec<&str> = expected();
    rev.reverse();
    assert_eq!(collect_backward(&mut it)?, rev);
    Ok(())
}

#[test]
fn seeks_position_every_child() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut it = build(&store)?;

    it.seek_ge(b"c")?;
    assert_eq!(render(it.current().unwrap()), "c#7,DEL=");
    it.seek_lt(b"c")?;
    assert_eq!(render(it.current().unwrap()), "b#4,SET=b4");
    it.seek_lt(b"d")?;
    assert_eq!(render(it.current().unwrap()), "c#2,SET=c2");
    it.seek_ge(b"g")?;
    assert!(it.current().is_none());
    Ok(())
}

#[test]
fn direction_switches_do_not_skip_or_repeat() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut it = build(&store)?;
    let all = expected();

    // Walk to every position, step back once, then forward again.
    for pos in 0..all.len() {
        it.first()?;
        for _ in 0..pos {
            it.next()?;
        }
        assert_eq!(render(it.current().unwrap()), all[pos]);
        it.prev()?;
        if pos == 0 {
            assert!(it.current().is_none());
            continue;
        }
        assert_eq!(render(it.current().unwrap()), all[pos - 1]);
        it.next()?;
        assert_eq!(render(it.current().unwrap()), all[pos]);
        it.next()?;
        match all.get(pos + 1) {
            Some(want) => assert_eq!(render(it.current().unwrap()), *want),
            None => assert!(it.current().is_none()),
        }
    }
    Ok(())
}

#[test]
fn switch_after_seek_lt_inside_versions() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut it = build(&store)?;

    it.seek_lt(b"d")?;
    it.prev()?;
    assert_eq!(render(it.current().unwrap()), "c#5,SET=c5");
    it.next()?;
    assert_eq!(render(it.current().unwrap()), "c#2,SET=c2");
    it.next()?;
    assert_eq!(render(it.current().unwrap()), "d#8,SET=d8");
    Ok(())
}

#[test]
fn no_children_is_always_exhausted() -> Result<()> {
    let mut it = MergingIter::new(&DEFAULT_COMPARER, Vec::new());
    it.first()?;
    assert!(it.current().is_none());
    it.seek_lt(b"z")?;
    assert!(it.current().is_none());
    Ok(())
}
