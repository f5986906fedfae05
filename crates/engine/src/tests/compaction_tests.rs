use crate::tests::helpers::*;
use crate::*;
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn load(engine: &Engine, range: std::ops::Range<usize>, tag: &str) -> Result<()> {
    for i in range {
        engine.set(&key(i), format!("{}-{}", tag, i).as_bytes())?;
    }
    engine.flush()
}

fn table_entries(engine: &Engine, level: usize) -> u64 {
    engine
        .inner
        .versions
        .current()
        .files(level)
        .iter()
        .map(|f| f.stats.num_entries)
        .sum()
}

// --------------------- Leveled compaction ---------------------

#[test]
fn l0_files_compact_into_l1() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    for batch in 0..4 {
        load(&engine, batch * 50..batch * 50 + 60, &format!("b{}", batch))?;
    }
    let before = engine.metrics();
    assert_eq!(before.levels[0].files, 4);

    engine.compact()?;
    let m = engine.metrics();
    assert_eq!(m.levels[0].files, 0);
    assert!(m.version > before.version);
    assert!(m.next_file_num > before.next_file_num);
    assert!(m.levels[1].files >= 1);
    assert_eq!(m.compactions.count.get("default"), Some(&1));
    assert!(m.compactions.bytes_written > 0);

    // overlapping batches: the newest write of each key wins
    assert_eq!(engine.get(&key(55))?, Some(b"b1-55".to_vec()));
    assert_eq!(engine.get(&key(0))?, Some(b"b0-0".to_vec()));
    assert_eq!(engine.get(&key(209))?, Some(b"b3-209".to_vec()));
    assert_eq!(engine.scan(b"", b"")?.len(), 210);
    // without snapshots only the newest version of each key survives
    assert_eq!(table_entries(&engine, 1), 210);
    Ok(())
}

#[test]
fn compact_is_a_noop_below_threshold() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    load(&engine, 0..10, "v")?;
    engine.compact()?;
    let m = engine.metrics();
    assert_eq!(m.levels[0].files, 1);
    assert!(m.compactions.count.is_empty());
    Ok(())
}

#[test]
fn single_file_is_moved_without_rewrite() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        l0_compaction_threshold: 1,
        ..test_options()
    };
    let engine = Engine::open(dir.path(), opts)?;
    let events = recorder();
    engine.set_event_listener(Some(Arc::clone(&events) as Arc<dyn EventListener>));
    load(&engine, 0..20, "v")?;
    let num = engine.inner.versions.current().files(0)[0].file_num;

    engine.compact()?;
    let version = engine.inner.versions.current();
    assert!(version.files(0).is_empty());
    assert_eq!(version.files(1).len(), 1);
    assert_eq!(version.files(1)[0].file_num, num);
    assert_eq!(engine.metrics().compactions.count.get("move"), Some(&1));
    assert!(events.events.lock().iter().any(|e| matches!(
        e,
        Event::CompactionEnd {
            kind: CompactionKind::Move,
            outputs: 0,
            ..
        }
    )));
    assert_eq!(engine.get(&key(7))?, Some(b"v-7".to_vec()));
    Ok(())
}

#[test]
fn compactions_report_begin_and_end() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    let events = recorder();
    engine.set_event_listener(Some(Arc::clone(&events) as Arc<dyn EventListener>));
    for batch in 0..4 {
        load(&engine, 0..30, &format!("b{}", batch))?;
    }
    engine.compact()?;

    let events = events.events.lock();
    let begin = events
        .iter()
        .position(|e| {
            matches!(
                e,
                Event::CompactionBegin {
                    kind: CompactionKind::Default,
                    start_level: 0,
                    output_level: 1,
                    ..
                }
            )
        })
        .expect("compaction began");
    let end = events
        .iter()
        .position(|e| matches!(e, Event::CompactionEnd { output_level: 1, .. }))
        .expect("compaction ended");
    assert!(begin < end);
    assert!(events.contains(&Event::CompactionNeeded));
    Ok(())
}

#[test]
fn levels_stay_sorted_and_disjoint() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    let value = vec![b'x'; 64];
    for round in 0..6 {
        for i in (round..3000).step_by(6) {
            engine.set(&key(i), &value)?;
        }
        engine.flush()?;
    }
    engine.compact()?;

    let version = engine.inner.versions.current();
    version.check_ordering()?;
    let cmp = engine.options().comparer;
    for level in 1..NUM_LEVELS {
        for pair in version.files(level).windows(2) {
            assert_eq!(
                cmp.cmp(&pair[0].largest.user_key, &pair[1].smallest.user_key),
                std::cmp::Ordering::Less,
                "L{} files {:06} and {:06} overlap",
                level,
                pair[0].file_num,
                pair[1].file_num
            );
        }
    }
    // L1 overflowed its 16KiB target and spilled into L2
    assert!(version.num_files(2) > 0);
    assert!(engine.metrics().levels[1].score < 1.0);
    assert_eq!(engine.scan(b"", b"")?.len(), 3000);
    Ok(())
}

#[test]
fn outputs_respect_the_target_file_size() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    let value = vec![b'v'; 100];
    for round in 0..4 {
        for i in (round..800).step_by(4) {
            engine.set(&key(i), &value)?;
        }
        engine.flush()?;
    }
    engine.compact_range(&key(0), &key(800))?;

    let version = engine.inner.versions.current();
    assert!(version.num_files(1) > 1);
    // a file closes at the first key past the target
    let target = engine.options().target_file_size;
    for f in version.files(1) {
        assert!(f.size < target * 2, "{:06} is {} bytes", f.file_num, f.size);
    }
    Ok(())
}

// --------------------- Garbage removal ---------------------

#[test]
fn shadowed_versions_and_tombstones_are_dropped() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    load(&engine, 0..100, "old")?;
    load(&engine, 0..50, "new")?;
    for i in 90..100 {
        engine.delete(&key(i))?;
    }
    engine.flush()?;

    engine.compact_range(&key(0), &key(100))?;
    let version = engine.inner.versions.current();
    assert!(version.files(0).is_empty());
    let deletions: u64 = version.files(1).iter().map(|f| f.stats.num_deletions).sum();
    assert_eq!(deletions, 0);
    assert_eq!(table_entries(&engine, 1), 90);
    assert_eq!(engine.get(&key(10))?, Some(b"new-10".to_vec()));
    assert_eq!(engine.get(&key(60))?, Some(b"old-60".to_vec()));
    assert_eq!(engine.get(&key(95))?, None);
    Ok(())
}

#[test]
fn tombstones_for_missing_keys_do_not_reach_the_bottom() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    engine.set(b"a", b"1")?;
    engine.set(b"z", b"2")?;
    engine.flush()?;
    engine.delete(b"d")?;
    engine.single_delete(b"s")?;
    engine.flush()?;

    engine.compact_range(b"a", b"z")?;
    let version = engine.inner.versions.current();
    let deletions: u64 = (0..NUM_LEVELS)
        .flat_map(|l| version.files(l).iter().map(|f| f.stats.num_deletions).collect::<Vec<_>>())
        .sum();
    assert_eq!(deletions, 0);
    assert_eq!(table_entries(&engine, 1), 2);
    assert_eq!(engine.scan(b"", b"")?, vec![kv("a", "1"), kv("z", "2")]);
    Ok(())
}

#[test]
fn range_deletion_is_applied_and_elided() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    load(&engine, 0..100, "v")?;
    engine.compact_range(&key(0), &key(100))?;
    engine.delete_range(&key(10), &key(50))?;
    engine.flush()?;

    engine.compact_range(&key(0), &key(100))?;
    let version = engine.inner.versions.current();
    assert!(version.files(0).is_empty());
    let range_dels: u64 = version
        .files(1)
        .iter()
        .map(|f| f.stats.num_range_deletions)
        .sum();
    assert_eq!(range_dels, 0);
    assert_eq!(table_entries(&engine, 1), 60);
    assert_eq!(engine.get(&key(10))?, None);
    assert_eq!(engine.get(&key(50))?, Some(b"v-50".to_vec()));
    Ok(())
}

#[test]
fn obsolete_tables_are_deleted() -> Result<()> {
    let dir = tempdir()?;
    let mut engine = Engine::open(dir.path(), test_options())?;
    for batch in 0..4 {
        load(&engine, 0..40, &format!("b{}", batch))?;
    }
    assert_eq!(count_files(dir.path(), "sst"), 4);
    engine.compact()?;
    engine.close()?;
    // the cleaner has drained by the time close returns
    assert_eq!(
        count_files(dir.path(), "sst"),
        engine.metrics().levels.iter().map(|l| l.files).sum::<usize>()
    );
    Ok(())
}

// --------------------- Manual compaction ---------------------

#[test]
fn compact_range_merges_newer_data_down() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    load(&engine, 0..100, "old")?;
    engine.compact_range(&key(0), &key(100))?;
    assert_eq!(engine.metrics().levels[1].files, 1);

    load(&engine, 20..40, "new")?;
    engine.compact_range(&key(0), &key(100))?;
    let m = engine.metrics();
    assert_eq!(m.levels[0].files, 0);
    assert_eq!(m.compactions.count.get("manual"), Some(&2));
    assert_eq!(engine.get(&key(25))?, Some(b"new-25".to_vec()));
    assert_eq!(engine.get(&key(45))?, Some(b"old-45".to_vec()));
    assert_eq!(table_entries(&engine, 1), 100);
    Ok(())
}

#[test]
fn compact_range_outside_the_data_does_nothing() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path(), test_options())?;
    load(&engine, 0..10, "v")?;
    engine.compact_range(b"zzz0", b"zzz9")?;
    assert_eq!(engine.metrics().levels[0].files, 1);
    assert!(engine.compact_range(b"b", b"a").is_err());
    Ok(())
}

// --------------------- Background compaction ---------------------

#[test]
fn workers_compact_automatically() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        disable_automatic_compactions: false,
        l0_compaction_threshold: 2,
        ..test_options()
    };
    let engine = Engine::open(dir.path(), opts)?;
    load(&engine, 0..50, "a")?;
    load(&engine, 25..75, "b")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.metrics().levels[0].files > 0 {
        assert!(Instant::now() < deadline, "background compaction did not run");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.get(&key(30))?, Some(b"b-30".to_vec()));
    assert_eq!(engine.scan(b"", b"")?.len(), 75);
    Ok(())
}

#[test]
fn disabled_compactions_leave_l0_alone() -> Result<()> {
    let dir = tempdir()?;
    let opts = Options {
        l0_compaction_threshold: 2,
        ..test_options()
    };
    let engine = Engine::open(dir.path(), opts)?;
    let events = recorder();
    engine.set_event_listener(Some(Arc::clone(&events) as Arc<dyn EventListener>));
    load(&engine, 0..50, "a")?;
    load(&engine, 0..50, "b")?;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.metrics().levels[0].files, 2);
    assert!(events.events.lock().contains(&Event::CompactionNeeded));
    Ok(())
}
