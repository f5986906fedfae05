/// Cold start: recovering the version set, replaying WAL files and
/// removing objects no version references.
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base::{corruption, invalid_argument, SeqNum};
use config::Options;
use crossbeam_channel::{unbounded, Sender};
use memtable::Memtable;
use parking_lot::{Condvar, Mutex, RwLock};
use sstable::{FsObjectStore, ObjectStore};
use tracing::{debug, info};
use wal::{WalError, WalReader, WalRecord, WalWriter};

use crate::background::{spawn_cleaner, spawn_workers, CleanupJob, Job};
use crate::compaction::CompactionState;
use crate::file_cache::FileCache;
use crate::filenames::{log_name, parse, read_current, FileType};
use crate::snapshot::SnapshotList;
use crate::version_set::VersionSet;
use crate::{Engine, EngineInner, MemState};

/// Replays a WAL file into `mem`, returning the highest sequence number
/// encountered (`0` for an empty log).
///
/// A truncated final record ends the log; it was never acknowledged.
///
/// # Errors
///
/// A checksum mismatch or undecodable record is a corruption error.
pub fn replay_wal<P: AsRef<Path>>(path: P, mem: &Memtable) -> Result<SeqNum> {
    let path = path.as_ref();
    let mut reader = WalReader::open(path)
        .map_err(|e| anyhow!(e).context(format!("failed to open {} for replay", path.display())))?;
    let mut max_seq = 0;
    reader
        .replay(|r| {
            max_seq = max_seq.max(r.seq());
            match r {
                WalRecord::Point {
                    seq,
                    kind,
                    key,
                    value,
                } => mem.add(seq, kind, &key, &value),
                WalRecord::Span {
                    seq,
                    kind,
                    start,
                    end,
                    suffix,
                    value,
                } => mem.add_span(seq, kind, &start, &end, &suffix, &value),
            }
        })
        .map_err(|e| match e {
            WalError::Corrupt => corruption(format!("corrupt record in {}", path.display())),
            WalError::Io(io) => anyhow!(io).context(format!("failed to replay {}", path.display())),
        })?;
    Ok(max_seq)
}

/// Queues every object in `dir` that the recovered state no longer needs.
///
/// `old_manifest` is skipped: recovery already retired it.
pub(crate) fn remove_unreferenced(
    dir: &Path,
    versions: &VersionSet,
    old_manifest: Option<u64>,
    cleanup: &Sender<CleanupJob>,
) -> Result<usize> {
    let version = versions.current();
    let mut live: BTreeSet<u64> = version.blob_files().keys().copied().collect();
    for level in 0..crate::NUM_LEVELS {
        live.extend(version.files(level).iter().map(|f| f.backing.disk_file_num));
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((file_type, num)) = parse(&name.to_string_lossy()) else {
            continue;
        };
        versions.mark_file_num_used(num);
        let obsolete = match file_type {
            FileType::Table | FileType::Blob => !live.contains(&num),
            FileType::Log => num < versions.min_unflushed_log(),
            FileType::Manifest => num != versions.manifest_num() && Some(num) != old_manifest,
        };
        if obsolete {
            debug!(file = %name.to_string_lossy(), "found unreferenced object");
            if cleanup.send(CleanupJob::Obsolete(file_type, num)).is_err() {
                debug!(file = %name.to_string_lossy(), "cleanup thread gone, leaving object");
                continue;
            }
            removed += 1;
        }
    }
    Ok(removed)
}

impl Engine {
    /// Opens (creating if needed) the database in `dir`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Validate `opts` and create the directory.
    /// 2. Remove temporary objects left by interrupted writers.
    /// 3. Recover the version set from `CURRENT` and its manifest, or
    ///    create a new database.
    /// 4. Queue tables, blob files, WALs and manifests that nothing
    ///    references for deletion.
    /// 5. Replay every WAL at or after the minimum unflushed log number
    ///    into its own memtable and restore the sequence numbers.
    /// 6. Start a fresh WAL, flush the replayed memtables and start the
    ///    background threads.
    ///
    /// # Errors
    ///
    /// Invalid options are an invalid-argument error; a damaged manifest
    /// or WAL is a corruption error. Nothing is repaired.
    pub fn open<P: AsRef<Path>>(dir: P, opts: Options) -> Result<Self> {
        opts.validate()
            .map_err(|e| invalid_argument(e.to_string()))?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;

        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::open(&dir)?);
        let cache = Arc::new(FileCache::new(
            Arc::clone(&store),
            opts.comparer,
            opts.table_cache_capacity,
        ));
        let (cleanup_tx, cleanup_rx) = unbounded();

        let old_manifest = read_current(&dir)?;
        let versions = match VersionSet::recover(&dir, &opts, Some(cleanup_tx.clone()))? {
            Some(vs) => vs,
            None => VersionSet::create(&dir, &opts, Some(cleanup_tx.clone()))?,
        };
        let orphans = remove_unreferenced(&dir, &versions, old_manifest, &cleanup_tx)?;

        let mut logs: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse(&e.file_name().to_string_lossy()))
            .filter(|&(t, n)| t == FileType::Log && n >= versions.min_unflushed_log())
            .map(|(_, n)| n)
            .collect();
        logs.sort_unstable();

        let mut immutables = Vec::with_capacity(logs.len());
        let mut replayed = 0;
        for &num in &logs {
            let mem = Arc::new(Memtable::new(opts.comparer));
            let max_seq = replay_wal(dir.join(log_name(num)), &mem)?;
            if max_seq > 0 {
                versions.restore_seq(max_seq);
            }
            replayed += mem.len();
            immutables.push((mem, num));
        }

        let log_num = versions.new_file_num();
        let wal = WalWriter::create(dir.join(log_name(log_num)), opts.wal_sync)
            .map_err(|e| anyhow!(e).context("failed to create WAL"))?;

        let cleaner = spawn_cleaner(
            dir.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            cleanup_rx,
        )?;
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let workers = opts.max_concurrent_compactions;
        let inner = Arc::new(EngineInner {
            dir: dir.clone(),
            mem: RwLock::new(MemState {
                mutable: Arc::new(Memtable::new(opts.comparer)),
                log_num,
                immutables,
            }),
            opts,
            store,
            cache,
            versions,
            snapshots: SnapshotList::default(),
            wal: Mutex::new(wal),
            flush_lock: Mutex::new(()),
            flushes: AtomicU64::new(0),
            flush_bytes: AtomicU64::new(0),
            compactions: Mutex::new(CompactionState::default()),
            compaction_done: Condvar::new(),
            jobs: Mutex::new(Some(jobs_tx)),
            cleanup: cleanup_tx,
            bg_error: Mutex::new(None),
            closed: AtomicBool::new(false),
            listener: RwLock::new(None),
        });
        let mut engine = Engine {
            inner: Arc::clone(&inner),
            workers: Vec::new(),
            cleaner: Some(cleaner),
        };

        inner.flush_immutables()?;
        engine.workers = spawn_workers(&inner, jobs_rx, workers)?;
        inner.schedule(Job::MaybeCompact);

        info!(
            dir = %dir.display(),
            logs = logs.len(),
            replayed,
            orphans,
            files = inner.versions.current().total_files(),
            visible_seq = inner.versions.visible_seq(),
            "opened engine"
        );
        Ok(engine)
    }
}
