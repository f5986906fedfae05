use std::fs;
use std::sync::Arc;

use anyhow::Result;
use base::{
    classify, make_trailer, BlobHandle, Error, InlineHandle, InternalIterator, InternalKey,
    InternalKeyKind, InternalValue, Span, SpanKey, DEFAULT_COMPARER, VERSIONED_COMPARER,
};
use tempfile::tempdir;

use super::{collect_backward, collect_forward, ikey, render, set, write_table};
use crate::*;

fn versions() -> Vec<(InternalKey, &'static str)> {
    vec![
        (set("a", 1), "a1"),
        (set("b", 5), "b5"),
        (ikey("b", 4, InternalKeyKind::Merge), "b4"),
        (set("b", 2), "b2"),
        (ikey("c", 3, InternalKeyKind::Delete), ""),
        (set("d", 6), "d6"),
    ]
}

// -------------------- Round trip --------------------

#[test]
fn iterate_both_directions_across_blocks() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let points: Vec<(InternalKey, String)> = (0..500u64)
        .map(|i| (set(&format!("key{:04}", i), i + 1), format!("value{}", i)))
        .collect();
    let borrowed: Vec<(InternalKey, &str)> =
        points.iter().map(|(k, v)| (k.clone(), v.as_str())).collect();

    // Tiny blocks force many index entries.
    let (meta, reader) = write_table(&store, "000001.sst", &borrowed, 128)?;
    assert!(reader.properties().num_data_blocks > 10);
    assert_eq!(reader.properties().num_entries, 500);
    assert_eq!(meta.smallest_seq, 1);
    assert_eq!(meta.largest_seq, 500);

    let mut it = reader.iter(TableIterOptions::default());
    let fwd = collect_forward(&mut it)?;
    assert_eq!(fwd.len(), 500);
    assert_eq!(fwd[0], "key0000#1,SET=value0");
    assert_eq!(fwd[499], "key0499#500,SET=value499");

    let mut bwd = collect_backward(&mut it)?;
    bwd.reverse();
    assert_eq!(fwd, bwd);
    Ok(())
}

#[test]
fn seeks_land_on_user_key_versions() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let (_, reader) = write_table(&store, "000001.sst", &versions(), 64)?;
    let mut it = reader.iter(TableIterOptions::default());

    it.seek_ge(b"b")?;
    assert_eq!(render(it.current().unwrap()), "b#5,SET=b5");

    it.seek_ge(b"bb")?;
    assert_eq!(it.current().unwrap().key.to_string(), "c#3,DEL");

    // Oldest version of the last user key before "c".
    it.seek_lt(b"c")?;
    assert_eq!(render(it.current().unwrap()), "b#2,SET=b2");
    it.prev()?;
    assert_eq!(render(it.current().unwrap()), "b#4,MERGE=b4");

    it.seek_lt(b"a")?;
    assert!(it.current().is_none());
    it.seek_ge(b"e")?;
    assert!(it.current().is_none());

    it.seek_lt(b"zzz")?;
    assert_eq!(render(it.current().unwrap()), "d#6,SET=d6");
    Ok(())
}

#[test]
fn empty_table_iterates_nothing() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let (meta, reader) = write_table(&store, "000001.sst", &[], 4096)?;
    assert!(meta.smallest_point.is_none());
    let mut it = reader.iter(TableIterOptions::default());
    assert!(collect_forward(&mut it)?.is_empty());
    assert!(collect_backward(&mut it)?.is_empty());
    Ok(())
}

// -------------------- Writer invariants --------------------

#[test]
fn out_of_order_keys_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&DEFAULT_COMPARER, 4096),
    );
    w.add(&set("b", 2), b"x")?;
    let err = w.add(&set("a", 3), b"y").unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Invariant(_))));
    // Same user key with an older-or-equal trailer is also out of order.
    let err = w.add(&set("b", 2), b"y").unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Invariant(_))));
    w.abort();

    assert!(store.list()?.is_empty());
    Ok(())
}

#[test]
fn overlapping_spans_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&DEFAULT_COMPARER, 4096),
    );
    let del = |start: &str, end: &str| {
        Span::new(
            start,
            end,
            vec![SpanKey::new(make_trailer(3, InternalKeyKind::RangeDelete), &b""[..], &b""[..])],
        )
    };
    w.add_range_del(&del("a", "c"))?;
    assert!(w.add_range_del(&del("b", "d")).is_err());
    w.abort();
    Ok(())
}

// -------------------- Metadata --------------------

#[test]
fn bounds_cover_points_and_spans() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&DEFAULT_COMPARER, 4096),
    );
    w.add(&set("c", 4), b"c")?;
    w.add(&set("d", 2), b"d")?;
    w.add_range_del(&Span::new(
        "b",
        "z",
        vec![SpanKey::new(make_trailer(7, InternalKeyKind::RangeDelete), &b""[..], &b""[..])],
    ))?;
    w.add_range_key(&Span::new(
        "a",
        "c",
        vec![SpanKey::new(make_trailer(9, InternalKeyKind::RangeKeySet), "@2", "foo")],
    ))?;
    let meta = w.finish()?;

    assert_eq!(meta.smallest_point.as_ref().unwrap().to_string(), "b#7,RANGEDEL");
    assert_eq!(meta.largest_point.as_ref().unwrap().to_string(), "z#inf,RANGEDEL");
    assert_eq!(meta.smallest_range_key.as_ref().unwrap().to_string(), "a#9,RANGEKEYSET");
    assert_eq!(meta.largest_range_key.as_ref().unwrap().to_string(), "c#inf,RANGEKEYSET");
    assert_eq!(meta.smallest(&DEFAULT_COMPARER).unwrap().to_string(), "a#9,RANGEKEYSET");
    assert_eq!(meta.largest(&DEFAULT_COMPARER).unwrap().to_string(), "z#inf,RANGEDEL");
    assert!(meta.largest(&DEFAULT_COMPARER).unwrap().is_exclusive_sentinel());
    assert_eq!((meta.smallest_seq, meta.largest_seq), (2, 9));
    assert_eq!(meta.properties.num_range_deletions, 1);
    assert_eq!(meta.properties.num_range_keys, 1);
    assert_eq!(meta.size, fs::metadata(dir.path().join("000001.sst"))?.len());

    let reader = TableReader::open(store.open("000001.sst")?, &DEFAULT_COMPARER)?;
    assert_eq!(reader.range_dels().len(), 1);
    assert_eq!(format!("{:?}", reader.range_keys()[0]), "[a-c):[#9,RANGEKEYSET @2=foo]");
    assert_eq!(reader.properties(), &meta.properties);
    Ok(())
}

// -------------------- Filter --------------------

#[test]
fn filter_rules_out_missing_keys() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let points: Vec<(InternalKey, &str)> = (0..200u64)
        .map(|i| (set(&format!("key{:04}", i), i + 1), "v"))
        .collect();
    let (_, reader) = write_table(&store, "000001.sst", &points, 512)?;

    assert_eq!(reader.properties().num_filter_keys, 200);
    for i in 0..200 {
        assert!(reader.may_contain_prefix(format!("key{:04}", i).as_bytes()));
    }
    let false_positives = (0..200)
        .filter(|i| reader.may_contain_prefix(format!("other{:04}", i).as_bytes()))
        .count();
    assert!(false_positives < 40, "{} false positives", false_positives);
    Ok(())
}

#[test]
fn filter_holds_prefixes_of_versioned_keys() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&VERSIONED_COMPARER, 4096),
    );
    for (k, seq) in [("a@3", 3), ("a@1", 1), ("b@2", 2)] {
        w.add(&set(k, seq), b"v")?;
    }
    w.finish()?;
    let reader = TableReader::open(store.open("000001.sst")?, &VERSIONED_COMPARER)?;

    assert_eq!(reader.properties().num_filter_keys, 2);
    assert!(reader.may_contain_prefix(b"a"));
    assert!(reader.may_contain_prefix(b"b"));
    Ok(())
}

#[test]
fn tables_without_a_filter_never_rule_out() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&DEFAULT_COMPARER, 4096).with_bloom_bits(0),
    );
    w.add(&set("a", 1), b"v")?;
    w.finish()?;
    let reader = TableReader::open(store.open("000001.sst")?, &DEFAULT_COMPARER)?;

    assert_eq!(reader.properties().num_filter_keys, 0);
    assert!(reader.may_contain_prefix(b"zzz"));
    Ok(())
}

// -------------------- Blob handles --------------------

#[test]
fn blob_handles_resolve_through_reference_list() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let mut w = TableWriter::new(
        store.create("000001.sst")?,
        WriterOptions::new(&DEFAULT_COMPARER, 4096),
    );
    let handle = InlineHandle {
        reference_index: 1,
        handle: BlobHandle {
            block_num: 3,
            offset_in_block: 17,
            value_len: 4000,
        },
    };
    w.add(&set("a", 1), b"inline")?;
    w.add_with_blob_handle(&set("b", 2), handle, 0x5A)?;
    let meta = w.finish()?;
    assert_eq!(meta.properties.num_blob_handles, 1);
    assert_eq!(meta.properties.blob_value_size, 4000);

    let reader = Arc::new(TableReader::open(store.open("000001.sst")?, &DEFAULT_COMPARER)?);
    let mut it = reader.iter(TableIterOptions {
        blob_refs: Arc::from(vec![40u64, 41]),
        ..Default::default()
    });
    it.seek_ge(b"b")?;
    match &it.current().unwrap().value {
        InternalValue::Blob(b) => {
            assert_eq!(b.file_num, 41);
            assert_eq!(b.handle, handle.handle);
            assert_eq!(b.short_attr, 0x5A);
        }
        other => panic!("expected blob value, got {:?}", other),
    }

    // Without a reference list the handle cannot be resolved.
    let mut it = reader.iter(TableIterOptions::default());
    let err = it.seek_ge(b"b").unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Corruption(_))));
    Ok(())
}

// -------------------- Virtual bounds --------------------

#[test]
fn virtual_bounds_clip_iteration() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    let (_, reader) = write_table(&store, "000001.sst", &versions(), 64)?;
    let mut it = reader.iter(TableIterOptions {
        lower: Some(ikey("b", 4, InternalKeyKind::Merge)),
        upper: Some(InternalKey::exclusive_sentinel(b"d".to_vec(), InternalKeyKind::RangeDelete)),
        ..Default::default()
    });
    assert_eq!(
        collect_forward(&mut it)?,
        vec!["b#4,MERGE=b4", "b#2,SET=b2", "c#3,DEL="]
    );
    assert_eq!(
        collect_backward(&mut it)?,
        vec!["c#3,DEL=", "b#2,SET=b2", "b#4,MERGE=b4"]
    );
    it.seek_ge(b"a")?;
    assert_eq!(it.current().unwrap().key.to_string(), "b#4,MERGE");
    it.seek_lt(b"z")?;
    assert_eq!(it.current().unwrap().key.to_string(), "c#3,DEL");
    it.seek_ge(b"d")?;
    assert!(it.current().is_none());
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn flipped_data_byte_fails_checksum() -> Result<()> {
    let dir = tempdir()?;
    let store = FsObjectStore::open(dir.path())?;
    write_table(&store, "000001.sst", &versions(), 4096)?;

    let path = dir.path().join("000001.sst");
    let mut data = fs::read(&path)?;
    data[3] ^= 0xFF;
    fs::write(&path, &data)?;

    let reader = Arc::new(TableReader::open(store.open("000001.sst")?, &DEFAULT_COMPARER)?);
    let mut it = reader.iter(TableIterOptions::default());
    let err = it.first().unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Corruption(_))));
    assert!(err.to_string().contains("checksum"));
    Ok(())
}

#[test]
fn foreign_formats_are_not_readable() -> Result<()> {
    let dir = tempdir()?;
    let mut data = vec![0u8; 100];
    data.extend_from_slice(
        &Footer {
            format: TableFormat::LevelDb,
            checksum: ChecksumType::Crc32,
            metaindex: BlockHandle::new(0, 10),
            index: BlockHandle::new(10, 10),
        }
        .encode(),
    );
    fs::write(dir.path().join("000001.sst"), &data)?;
    let store = FsObjectStore::open(dir.path())?;
    let err = TableReader::open(store.open("000001.sst")?, &DEFAULT_COMPARER).unwrap_err();
    assert!(err.to_string().contains("leveldb"));
    Ok(())
}

// -------------------- Object store --------------------

#[test]
fn temporaries_are_removed_on_open() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("000009.sst.tmp"), b"partial")?;
    fs::write(dir.path().join("000003.sst"), b"done")?;
    let store = FsObjectStore::open(dir.path())?;
    assert_eq!(store.list()?, vec!["000003.sst".to_string()]);
    assert!(!dir.path().join("000009.sst.tmp").exists());

    let r = store.open("000003.sst")?;
    assert_eq!(r.read_at(1, 3)?, b"one");
    assert!(r.read_at(2, 3).is_err());
    store.remove("000003.sst")?;
    assert!(store.list()?.is_empty());
    Ok(())
}
