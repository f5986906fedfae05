//! The version set: the current version, the manifest, file numbers and
//! sequence numbers.
//!
//! ```text
//!   readers ── current() ──► ArcSwap<Version>        lock-free load
//!
//!   log_and_apply(edit)
//!     lock apply mutex
//!     base  = current
//!     parts = base + edit            (invariant errors abort here)
//!     append edit to MANIFEST, fsync (rotate when too large)
//!     swap current, notify subscribers
//! ```
//!
//! Sequence numbers: `log_seq_num` is the next number handed to a write;
//! `visible_seq_num` is the newest write that reads may observe. The
//! visible number never passes `log_seq_num - 1` and only advances once
//! the WAL has accepted the write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use base::{corruption, invalid_argument, invariant, Comparer, SeqNum};
use config::Options;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wal::{LogReader, LogWriter, WalError};

use crate::background::CleanupJob;
use crate::filenames::{manifest_name, read_current, set_current, FileType};
use crate::version::Version;
use crate::version_edit::{BulkVersionEdit, VersionEdit};

struct ManifestState {
    writer: LogWriter,
    file_num: u64,
}

pub struct VersionSet {
    dir: PathBuf,
    cmp: &'static Comparer,
    max_manifest_size: u64,
    paranoid_checks: bool,
    current: ArcSwap<Version>,
    /// Held for the whole of `log_and_apply`.
    manifest: Mutex<ManifestState>,
    next_file_num: Arc<AtomicU64>,
    log_seq_num: AtomicU64,
    visible_seq_num: AtomicU64,
    min_unflushed_log: AtomicU64,
    version_num: AtomicU64,
    subscribers: Mutex<Vec<Sender<u64>>>,
    cleanup: Option<Sender<CleanupJob>>,
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("dir", &self.dir)
            .field("manifest", &self.manifest_num())
            .field("next_file_num", &self.next_file_num.load(Ordering::Acquire))
            .field("log_seq_num", &self.log_seq_num())
            .field("visible_seq_num", &self.visible_seq())
            .field("min_unflushed_log", &self.min_unflushed_log())
            .finish()
    }
}

fn map_manifest_err(e: WalError, path: &Path) -> anyhow::Error {
    match e {
        WalError::Corrupt => corruption(format!("corrupt record in {}", path.display())),
        WalError::Io(io) => anyhow!(io).context(format!("failed to read {}", path.display())),
    }
}

impl VersionSet {
    /// Initialises an empty database in `dir`: manifest 1 plus `CURRENT`.
    pub fn create(
        dir: &Path,
        opts: &Options,
        cleanup: Option<Sender<CleanupJob>>,
    ) -> Result<Self> {
        let manifest_num = 1;
        let path = dir.join(manifest_name(manifest_num));
        let mut writer = LogWriter::create(&path, true)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let edit = VersionEdit {
            comparer_name: Some(opts.comparer.name.to_string()),
            log_number: Some(0),
            next_file_num: Some(manifest_num + 1),
            last_seq: Some(0),
            ..VersionEdit::default()
        };
        writer.append(&edit.encode())?;
        set_current(dir, manifest_num)?;
        info!(dir = %dir.display(), "created new database");

        Ok(Self::assemble(
            dir,
            opts,
            cleanup,
            Version::empty(opts.comparer),
            ManifestState {
                writer,
                file_num: manifest_num,
            },
            manifest_num + 1,
            0,
            0,
        ))
    }

    /// Replays the manifest named by `CURRENT` into one version and starts
    /// a fresh manifest holding a snapshot of it. Returns `None` when the
    /// directory holds no database.
    ///
    /// # Errors
    ///
    /// A checksum mismatch or undecodable edit is a corruption error; a
    /// comparer other than the one the database was created with is an
    /// invalid argument.
    pub fn recover(
        dir: &Path,
        opts: &Options,
        cleanup: Option<Sender<CleanupJob>>,
    ) -> Result<Option<Self>> {
        let Some(old_manifest) = read_current(dir)? else {
            return Ok(None);
        };
        let path = dir.join(manifest_name(old_manifest));
        let mut reader = LogReader::open(&path)
            .map_err(|e| map_manifest_err(e, &path))
            .with_context(|| format!("CURRENT names a missing manifest {}", path.display()))?;

        let cmp = opts.comparer;
        let mut bulk = BulkVersionEdit::new();
        let mut log_number = 0;
        let mut next_file_num = old_manifest + 1;
        let mut last_seq = 0;
        let mut edits = 0usize;
        while let Some(body) = reader.next_record().map_err(|e| map_manifest_err(e, &path))? {
            let edit = VersionEdit::decode(body)?;
            if let Some(name) = &edit.comparer_name {
                if name != cmp.name {
                    return Err(invalid_argument(format!(
                        "database uses comparer {}, opened with {}",
                        name, cmp.name
                    )));
                }
            }
            log_number = edit.log_number.unwrap_or(log_number).max(log_number);
            next_file_num = edit.next_file_num.unwrap_or(0).max(next_file_num);
            last_seq = edit.last_seq.unwrap_or(0).max(last_seq);
            for (_, f) in &edit.new_files {
                next_file_num = next_file_num.max(f.file_num + 1);
            }
            for b in &edit.new_blob_files {
                next_file_num = next_file_num.max(b.file_num + 1);
            }
            bulk.accumulate(&edit)?;
            edits += 1;
        }

        let parts = bulk.apply(&Version::empty(cmp), cmp)?;
        let version = Version::from_parts(parts, cmp, cleanup.clone()).with_log_number(log_number);
        version.check_ordering()?;

        let manifest_num = next_file_num;
        let new_path = dir.join(manifest_name(manifest_num));
        let writer = LogWriter::create(&new_path, true)
            .with_context(|| format!("failed to create {}", new_path.display()))?;
        let vs = Self::assemble(
            dir,
            opts,
            cleanup,
            version,
            ManifestState {
                writer,
                file_num: manifest_num,
            },
            manifest_num + 1,
            last_seq,
            log_number,
        );
        {
            let mut m = vs.manifest.lock();
            let snapshot = vs.snapshot_edit(&vs.current());
            m.writer.append(&snapshot.encode())?;
        }
        set_current(dir, manifest_num)?;
        vs.send_cleanup(FileType::Manifest, old_manifest);
        info!(
            manifest = old_manifest,
            edits,
            files = vs.current().total_files(),
            last_seq,
            "recovered version set"
        );
        Ok(Some(vs))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        dir: &Path,
        opts: &Options,
        cleanup: Option<Sender<CleanupJob>>,
        version: Version,
        manifest: ManifestState,
        next_file_num: u64,
        last_seq: SeqNum,
        log_number: u64,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cmp: opts.comparer,
            max_manifest_size: opts.max_manifest_size,
            paranoid_checks: opts.paranoid_checks,
            current: ArcSwap::from_pointee(version),
            manifest: Mutex::new(manifest),
            next_file_num: Arc::new(AtomicU64::new(next_file_num)),
            log_seq_num: AtomicU64::new(last_seq + 1),
            visible_seq_num: AtomicU64::new(last_seq),
            min_unflushed_log: AtomicU64::new(log_number),
            version_num: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            cleanup,
        }
    }

    fn snapshot_edit(&self, version: &Version) -> VersionEdit {
        let mut edit = version.snapshot_edit();
        edit.comparer_name = Some(self.cmp.name.to_string());
        edit.log_number = Some(self.min_unflushed_log());
        edit.next_file_num = Some(self.next_file_num.load(Ordering::Acquire));
        edit.last_seq = Some(self.visible_seq());
        edit
    }

    fn send_cleanup(&self, file_type: FileType, num: u64) {
        if let Some(tx) = &self.cleanup {
            if tx.send(CleanupJob::Obsolete(file_type, num)).is_err() {
                debug!(file_num = num, ?file_type, "cleanup thread gone, leaving object");
            }
        }
    }

    /// The current version. Never blocks.
    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    /// Persists `edit` and installs the version it produces.
    ///
    /// Blob files that no table references once the edit is applied are
    /// deleted by the same edit. On error nothing is installed.
    pub fn log_and_apply(&self, mut edit: VersionEdit) -> Result<Arc<Version>> {
        let mut m = self.manifest.lock();
        let base = self.current.load_full();

        if let Some(n) = edit.log_number {
            if n < self.min_unflushed_log() {
                return Err(invariant(format!(
                    "log number moved backwards: {} < {}",
                    n,
                    self.min_unflushed_log()
                )));
            }
        }
        edit.next_file_num = Some(self.next_file_num.load(Ordering::Acquire));
        edit.last_seq = Some(self.visible_seq());

        let mut parts = base.apply(&edit)?;
        for num in parts.unreferenced_blob_files() {
            parts.blob_files.remove(&num);
            let before = edit.new_blob_files.len();
            edit.new_blob_files.retain(|b| b.file_num != num);
            if edit.new_blob_files.len() == before {
                edit.deleted_blob_files.insert(num);
            }
        }
        let version = Version::from_parts(parts, self.cmp, self.cleanup.clone())
            .with_log_number(edit.log_number.unwrap_or(base.log_number()));
        if self.paranoid_checks || cfg!(debug_assertions) {
            version.check_ordering()?;
        }

        m.writer
            .append(&edit.encode())
            .map_err(|e| anyhow!(e).context("failed to append to manifest"))?;
        debug!(?edit, "logged version edit");

        if let Some(n) = edit.log_number {
            self.min_unflushed_log.store(n, Ordering::Release);
        }
        if m.writer.size() >= self.max_manifest_size {
            if let Err(e) = self.rotate_manifest(&mut m, &version) {
                warn!(error = %e, "manifest rotation failed, keeping the old manifest");
            }
        }

        let version = Arc::new(version);
        self.current.store(Arc::clone(&version));
        let num = self.version_num.fetch_add(1, Ordering::AcqRel) + 1;
        self.subscribers.lock().retain(|tx| tx.send(num).is_ok());
        Ok(version)
    }

    fn rotate_manifest(&self, m: &mut ManifestState, version: &Version) -> Result<()> {
        let num = self.new_file_num();
        let path = self.dir.join(manifest_name(num));
        let mut writer = LogWriter::create(&path, true)?;
        writer.append(&self.snapshot_edit(version).encode())?;
        set_current(&self.dir, num)?;
        let old = std::mem::replace(
            m,
            ManifestState {
                writer,
                file_num: num,
            },
        );
        info!(old = old.file_num, new = num, "rotated manifest");
        self.send_cleanup(FileType::Manifest, old.file_num);
        Ok(())
    }

    /// Receives the number of every version installed from now on.
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn version_num(&self) -> u64 {
        self.version_num.load(Ordering::Acquire)
    }

    pub fn manifest_num(&self) -> u64 {
        self.manifest.lock().file_num
    }

    pub fn new_file_num(&self) -> u64 {
        self.next_file_num.fetch_add(1, Ordering::AcqRel)
    }

    /// Makes sure future numbers stay above `num`.
    pub fn mark_file_num_used(&self, num: u64) {
        self.next_file_num.fetch_max(num + 1, Ordering::AcqRel);
    }

    /// A handle on the file number counter for writers that outlive a
    /// borrow of the version set.
    pub fn file_numbers(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.next_file_num)
    }

    pub fn next_file_num(&self) -> u64 {
        self.next_file_num.load(Ordering::Acquire)
    }

    pub fn min_unflushed_log(&self) -> u64 {
        self.min_unflushed_log.load(Ordering::Acquire)
    }

    /// The sequence number the next write will receive.
    pub fn log_seq_num(&self) -> SeqNum {
        self.log_seq_num.load(Ordering::Acquire)
    }

    /// Hands out `count` consecutive sequence numbers, returning the first.
    pub fn alloc_seq(&self, count: u64) -> SeqNum {
        self.log_seq_num.fetch_add(count, Ordering::AcqRel)
    }

    /// Newest sequence number visible to new reads.
    pub fn visible_seq(&self) -> SeqNum {
        self.visible_seq_num.load(Ordering::Acquire)
    }

    /// Publishes writes up to `seq`. Never moves backwards or past the
    /// last assigned number.
    pub fn advance_visible(&self, seq: SeqNum) {
        debug_assert!(seq < self.log_seq_num());
        self.visible_seq_num.fetch_max(seq, Ordering::AcqRel);
    }

    /// Raises both counters after WAL replay found writes up to `seq`.
    pub fn restore_seq(&self, seq: SeqNum) {
        self.log_seq_num.fetch_max(seq + 1, Ordering::AcqRel);
        self.visible_seq_num.fetch_max(seq, Ordering::AcqRel);
    }
}
