use crate::file_metadata::{BlobFileMetadata, BlobReference, FileBacking, FileMetadata, TableStats};
use crate::filenames::{manifest_name, read_current};
use crate::version::{Version, NUM_LEVELS};
use crate::version_edit::VersionEdit;
use crate::version_set::VersionSet;
use anyhow::Result;
use base::{InternalKey, InternalKeyKind, DEFAULT_COMPARER};
use config::Options;
use std::sync::Arc;
use tempfile::tempdir;

fn file(num: u64, lo: &str, hi: &str) -> Arc<FileMetadata> {
    Arc::new(
        FileMetadata::new(
            num,
            100 * num,
            InternalKey::new(lo, num, InternalKeyKind::Set),
            InternalKey::new(hi, num, InternalKeyKind::Set),
            num,
            num,
            FileBacking::new(num, 100 * num),
            false,
        )
        .with_stats(TableStats {
            num_entries: num,
            num_deletions: 1,
            ..TableStats::default()
        }),
    )
}

fn layout(v: &Version) -> Vec<Vec<(u64, Vec<u8>, Vec<u8>)>> {
    (0..NUM_LEVELS)
        .map(|l| {
            v.files(l)
                .iter()
                .map(|f| {
                    (
                        f.file_num,
                        f.smallest.user_key.clone(),
                        f.largest.user_key.clone(),
                    )
                })
                .collect()
        })
        .collect()
}

// --------------------- Version edits ---------------------

#[test]
fn edit_survives_encoding() -> Result<()> {
    let mut edit = VersionEdit {
        comparer_name: Some("shoal.BytewiseComparator".into()),
        log_number: Some(7),
        next_file_num: Some(42),
        last_seq: Some(1000),
        ..VersionEdit::default()
    };
    edit.add_file(0, file(3, "a", "m"));
    let with_blobs = FileMetadata::new(
        9,
        900,
        InternalKey::new("n", 9, InternalKeyKind::Set),
        InternalKey::new("z", 9, InternalKeyKind::Set),
        9,
        9,
        FileBacking::new(9, 900),
        false,
    )
    .with_blob_references(
        vec![BlobReference {
            file_num: 8,
            value_size: 4096,
        }],
        1,
    );
    edit.add_file(2, Arc::new(with_blobs));
    edit.delete_file(1, 5);
    edit.new_blob_files
        .push(Arc::new(BlobFileMetadata::new(8, 5000, 4096, 1_700_000_000)));
    edit.deleted_blob_files.insert(4);

    let decoded = VersionEdit::decode(&edit.encode())?;
    assert_eq!(decoded.comparer_name, edit.comparer_name);
    assert_eq!(decoded.log_number, Some(7));
    assert_eq!(decoded.next_file_num, Some(42));
    assert_eq!(decoded.last_seq, Some(1000));
    assert_eq!(decoded.deleted_files, edit.deleted_files);
    assert_eq!(decoded.deleted_blob_files, edit.deleted_blob_files);
    assert_eq!(decoded.new_files.len(), 2);
    let (level, f) = &decoded.new_files[1];
    assert_eq!(*level, 2);
    assert_eq!(f.file_num, 9);
    assert_eq!(f.largest.user_key, b"z".to_vec());
    assert_eq!(f.blob_references[0].file_num, 8);
    assert_eq!(f.blob_reference_depth, 1);
    assert_eq!(decoded.new_files[0].1.stats.num_entries, 3);
    assert_eq!(decoded.new_blob_files[0].value_size, 4096);
    Ok(())
}

#[test]
fn truncated_edit_is_corruption() {
    let mut edit = VersionEdit::default();
    edit.add_file(1, file(3, "a", "m"));
    let buf = edit.encode();
    let err = VersionEdit::decode(&buf[..buf.len() - 2]).unwrap_err();
    assert!(matches!(base::classify(&err), Some(base::Error::Corruption(_))));
}

#[test]
fn applying_an_edit_removes_then_adds() -> Result<()> {
    let dir = tempdir()?;
    let vs = VersionSet::create(dir.path(), &Options::default(), None)?;

    let mut edit = VersionEdit::default();
    edit.add_file(1, file(2, "a", "c"));
    edit.add_file(1, file(3, "d", "f"));
    edit.add_file(0, file(4, "b", "e"));
    vs.log_and_apply(edit)?;

    let mut edit = VersionEdit::default();
    edit.delete_file(1, 2);
    edit.add_file(1, file(5, "a", "b"));
    let v = vs.log_and_apply(edit)?;

    let nums = |l: usize| v.files(l).iter().map(|f| f.file_num).collect::<Vec<_>>();
    assert_eq!(nums(0), vec![4]);
    assert_eq!(nums(1), vec![5, 3]);
    assert_eq!(v.total_files(), 3);
    Ok(())
}

#[test]
fn deleting_a_missing_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let vs = VersionSet::create(dir.path(), &Options::default(), None)?;
    let mut edit = VersionEdit::default();
    edit.delete_file(3, 77);
    let err = vs.log_and_apply(edit).unwrap_err();
    assert!(matches!(base::classify(&err), Some(base::Error::Invariant(_))));
    assert!(vs.current().is_empty());
    Ok(())
}

#[test]
fn overlapping_files_in_a_level_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        paranoid_checks: true,
        ..Options::default()
    };
    let vs = VersionSet::create(dir.path(), &opts, None)?;
    let mut edit = VersionEdit::default();
    edit.add_file(1, file(2, "a", "m"));
    edit.add_file(1, file(3, "k", "z"));
    assert!(vs.log_and_apply(edit).is_err());
    assert!(vs.current().is_empty());
    Ok(())
}

#[test]
fn log_number_cannot_move_backwards() -> Result<()> {
    let dir = tempdir()?;
    let vs = VersionSet::create(dir.path(), &Options::default(), None)?;
    vs.log_and_apply(VersionEdit {
        log_number: Some(10),
        ..VersionEdit::default()
    })?;
    assert_eq!(vs.min_unflushed_log(), 10);
    let err = vs
        .log_and_apply(VersionEdit {
            log_number: Some(9),
            ..VersionEdit::default()
        })
        .unwrap_err();
    assert!(matches!(base::classify(&err), Some(base::Error::Invariant(_))));
    Ok(())
}

// --------------------- Recovery ---------------------

#[test]
fn recovery_reproduces_the_last_version() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options::default();
    let expected = {
        let vs = VersionSet::create(dir.path(), &opts, None)?;
        for (i, (lo, hi)) in [("a", "c"), ("d", "f"), ("g", "i")].iter().enumerate() {
            let num = vs.new_file_num();
            let mut edit = VersionEdit::default();
            edit.add_file(if i == 0 { 0 } else { 1 }, file(num, lo, hi));
            vs.log_and_apply(edit)?;
        }
        vs.alloc_seq(5);
        vs.advance_visible(4);
        let mut edit = VersionEdit::default();
        edit.delete_file(1, 3);
        vs.log_and_apply(edit)?;
        layout(&vs.current())
    };

    let vs = VersionSet::recover(dir.path(), &opts, None)?.expect("database exists");
    assert_eq!(layout(&vs.current()), expected);
    assert_eq!(vs.visible_seq(), 4);
    assert_eq!(vs.log_seq_num(), 5);
    assert!(vs.next_file_num() > 5);
    assert_eq!(read_current(dir.path())?, Some(vs.manifest_num()));

    // recovering again from the new manifest gives the same answer
    drop(vs);
    let vs = VersionSet::recover(dir.path(), &opts, None)?.expect("database exists");
    assert_eq!(layout(&vs.current()), expected);
    Ok(())
}

#[test]
fn recover_without_current_is_none() -> Result<()> {
    let dir = tempdir()?;
    assert!(VersionSet::recover(dir.path(), &Options::default(), None)?.is_none());
    Ok(())
}

#[test]
fn corrupt_manifest_is_reported() -> Result<()> {
    let dir = tempdir()?;
    {
        let vs = VersionSet::create(dir.path(), &Options::default(), None)?;
        let mut edit = VersionEdit::default();
        edit.add_file(1, file(2, "a", "c"));
        vs.log_and_apply(edit)?;
    }
    let path = dir.path().join(manifest_name(1));
    let mut bytes = std::fs::read(&path)?;
    let n = bytes.len();
    bytes[n - 5] ^= 0x55;
    std::fs::write(&path, bytes)?;

    let err = VersionSet::recover(dir.path(), &Options::default(), None).unwrap_err();
    assert!(matches!(base::classify(&err), Some(base::Error::Corruption(_))));
    Ok(())
}

#[test]
fn manifest_rotates_when_too_large() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        max_manifest_size: 64,
        ..Options::default()
    };
    let vs = VersionSet::create(dir.path(), &opts, None)?;
    let first = vs.manifest_num();
    for i in 0..5 {
        let num = vs.new_file_num();
        let mut edit = VersionEdit::default();
        edit.add_file(1, file(num, &format!("k{}", i), &format!("k{}z", i)));
        vs.log_and_apply(edit)?;
    }
    assert_ne!(vs.manifest_num(), first);
    assert_eq!(read_current(dir.path())?, Some(vs.manifest_num()));
    let expected = layout(&vs.current());
    drop(vs);

    let vs = VersionSet::recover(dir.path(), &opts, None)?.expect("database exists");
    assert_eq!(layout(&vs.current()), expected);
    Ok(())
}

#[test]
fn subscribers_see_every_version() -> Result<()> {
    let dir = tempdir()?;
    let vs = VersionSet::create(dir.path(), &Options::default(), None)?;
    let rx = vs.subscribe();
    let start = vs.version_num();
    vs.log_and_apply(VersionEdit::default())?;
    vs.log_and_apply(VersionEdit::default())?;
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![start + 1, start + 2]);
    Ok(())
}

#[test]
fn dropped_files_are_handed_to_cleanup() -> Result<()> {
    let dir = tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let vs = VersionSet::create(dir.path(), &Options::default(), Some(tx))?;
    let mut edit = VersionEdit::default();
    edit.add_file(1, file(2, "a", "c"));
    vs.log_and_apply(edit)?;

    let pinned = vs.current();
    let mut edit = VersionEdit::default();
    edit.delete_file(1, 2);
    vs.log_and_apply(edit)?;
    // still referenced by `pinned`
    assert!(rx.try_recv().is_err());

    drop(pinned);
    let job = rx.try_recv()?;
    assert_eq!(
        job,
        crate::background::CleanupJob::Obsolete(crate::filenames::FileType::Table, 2)
    );
    assert_eq!(DEFAULT_COMPARER.name, vs.current().comparer().name);
    Ok(())
}
