//! # Engine - the Shoal LSM storage engine
//!
//! Ties the [`memtable`], [`wal`] and [`sstable`] crates together into an
//! ordered key-value store with snapshots, range deletions, range keys and
//! background compaction.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌────────────────────────────────────────────────────────────┐
//! │                          ENGINE                            │
//! │                                                            │
//! │ write.rs → commit lock → WAL append → memtable insert      │
//! │              |                                             │
//! │              |  (memtable full?)  rotate + Job::Flush      │
//! │              v                                             │
//! │ workers ── flush_immutables() → L0 table → log_and_apply   │
//! │        └── maybe_compact() → picker → executor → edit      │
//! │                                                            │
//! │ read.rs → memtables + L0 tables + level iterators          │
//! │            merged, filtered at a sequence number           │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module             | Purpose                                             |
//! |--------------------|-----------------------------------------------------|
//! | `lib.rs`           | `Engine`, shared `EngineInner`, events, metrics     |
//! | [`recovery`]       | `Engine::open`: manifest + WAL replay, cleanup      |
//! | [`write`]          | validated writes, memtable rotation, flushes        |
//! | [`read`]           | `get`, `scan`, iterators, introspection             |
//! | [`version_set`]    | current version, manifest, file and seq numbers     |
//! | [`picker`]         | level scores and compaction selection               |
//! | [`executor`]       | output tables, splitting, blob files                |
//! | [`compaction_iter`]| per-key collapsing under snapshots and tombstones   |
//! | [`iterator`]       | the user-facing iterator                            |
//!
//! ## Crash Safety
//!
//! Every write reaches the WAL before the memtable. A WAL file is only
//! deleted after the manifest records a log number past it. Tables and
//! blob files are published with temp file + fsync + rename, and the
//! manifest is a CRC-framed log named by an atomically replaced `CURRENT`.

mod background;
mod compaction;
mod compaction_iter;
mod executor;
mod file_cache;
mod file_metadata;
mod filenames;
mod iterator;
mod level_iter;
mod picker;
mod read;
mod recovery;
mod snapshot;
mod value_separation;
mod version;
mod version_edit;
mod version_set;
mod write;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use base::{invariant, SeqNum};
use crossbeam_channel::{Receiver, Sender};
use memtable::Memtable;
use parking_lot::{Condvar, Mutex, RwLock};
use sstable::ObjectStore;
use tracing::{debug, info, trace, warn};
use wal::WalWriter;

use crate::background::{CleanupJob, Job};
use crate::compaction::CompactionState;
use crate::file_cache::FileCache;
use crate::filenames::blob_name;
use crate::snapshot::SnapshotList;
use crate::value_separation::BlobObjectFactory;
use crate::version::Version;
use crate::version_set::VersionSet;

pub use base::{Error, SpanKey};
pub use compaction::{CompactionKind, CompactionMetrics};
pub use config::Options;
pub use iterator::{IterOptions, IterState, IterValidity, Iterator, KeyTypes};
pub use snapshot::Snapshot;
pub use version::NUM_LEVELS;

/// Something the engine reports to an [`EventListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A memtable was rotated and waits for a flush.
    FlushNeeded,
    /// At least one level is over its target.
    CompactionNeeded,
    FlushEnd {
        tables: usize,
        bytes: u64,
    },
    CompactionBegin {
        id: u64,
        kind: CompactionKind,
        start_level: usize,
        output_level: usize,
    },
    CompactionEnd {
        id: u64,
        kind: CompactionKind,
        output_level: usize,
        outputs: usize,
    },
}

/// Receives [`Event`]s. Called on the thread doing the work, so it
/// should return quickly.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelMetrics {
    pub files: usize,
    pub size: u64,
    pub score: f64,
}

/// A point-in-time summary returned by [`Engine::metrics`].
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub levels: Vec<LevelMetrics>,
    pub blob_files: usize,
    pub blob_size: u64,
    pub memtable_size: usize,
    pub immutable_memtables: usize,
    pub flushes: u64,
    pub flush_bytes: u64,
    pub compactions: CompactionMetrics,
    pub snapshots: usize,
    pub open_tables: usize,
    pub visible_seq: SeqNum,
    /// Number of the installed version; bumped by every applied edit.
    pub version: u64,
    pub next_file_num: u64,
}

/// The memtables a read has to consult.
pub(crate) struct MemState {
    pub(crate) mutable: Arc<Memtable>,
    /// WAL backing `mutable`.
    pub(crate) log_num: u64,
    /// Rotated memtables waiting for a flush, oldest first, each with the
    /// WAL holding its writes.
    pub(crate) immutables: Vec<(Arc<Memtable>, u64)>,
}

/// State shared by the engine handle, snapshots, iterators and the
/// background workers.
pub(crate) struct EngineInner {
    pub(crate) dir: PathBuf,
    pub(crate) opts: Options,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) cache: Arc<FileCache>,
    pub(crate) versions: VersionSet,
    pub(crate) snapshots: SnapshotList,
    pub(crate) mem: RwLock<MemState>,
    /// The commit lock. Sequence numbers are allocated and the WAL is
    /// appended under it.
    pub(crate) wal: Mutex<WalWriter>,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) flushes: AtomicU64,
    pub(crate) flush_bytes: AtomicU64,
    pub(crate) compactions: Mutex<CompactionState>,
    pub(crate) compaction_done: Condvar,
    pub(crate) jobs: Mutex<Option<Sender<Job>>>,
    pub(crate) cleanup: Sender<CleanupJob>,
    bg_error: Mutex<Option<String>>,
    closed: AtomicBool,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
}

impl EngineInner {
    /// The memtables (newest first) and the version a read should use.
    ///
    /// A flush installs its version before it retires the memtable, so a
    /// memtable whose WAL the version already covers is skipped here.
    pub(crate) fn read_state(&self) -> (Vec<Arc<Memtable>>, Arc<Version>) {
        let m = self.mem.read();
        let version = self.versions.current();
        let mut mems = Vec::with_capacity(m.immutables.len() + 1);
        mems.push(Arc::clone(&m.mutable));
        mems.extend(
            m.immutables
                .iter()
                .rev()
                .filter(|(_, log)| *log >= version.log_number())
                .map(|(t, _)| Arc::clone(t)),
        );
        (mems, version)
    }

    pub(crate) fn with_commit_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _wal = self.wal.lock();
        f()
    }

    /// Fails once the engine is closed or a background job hit an
    /// invariant violation.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed.into());
        }
        if let Some(msg) = self.bg_error.lock().as_ref() {
            return Err(invariant(format!("background error: {}", msg)));
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records the first fatal background error.
    pub(crate) fn set_background_error(&self, e: &anyhow::Error) {
        let mut slot = self.bg_error.lock();
        if slot.is_none() {
            *slot = Some(format!("{:#}", e));
        }
    }

    pub(crate) fn schedule(&self, job: Job) {
        if let Some(tx) = self.jobs.lock().as_ref() {
            let _ = tx.send(job);
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        trace!(?event, "event");
        if let Some(l) = self.listener.read().as_ref() {
            l.on_event(&event);
        }
    }

    /// Creates blob files for the value separation policy, numbered from
    /// the shared file number counter.
    pub(crate) fn blob_object_factory(&self) -> BlobObjectFactory {
        let store = Arc::clone(&self.store);
        let nums = self.versions.file_numbers();
        Box::new(move || {
            let num = nums.fetch_add(1, Ordering::AcqRel);
            let w = store.create(&blob_name(num))?;
            Ok((num, w))
        })
    }
}

/// The Shoal storage engine.
///
/// All methods take `&self`; share an engine between threads by wrapping
/// it in an `Arc`.
///
/// # Write Path
///
/// 1. Validate the arguments.
/// 2. Under the commit lock, allocate a sequence number and append the
///    record to the WAL.
/// 3. Insert into the mutable memtable and publish the sequence number.
/// 4. If the memtable reached `memtable_size`, switch to a new WAL and a
///    new memtable and schedule a flush.
///
/// # Read Path
///
/// Reads merge every memtable, one iterator per L0 table and one level
/// iterator per deeper level, and resolve each user key at the read's
/// sequence number.
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
    workers: Vec<JoinHandle<()>>,
    cleaner: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = self.inner.versions.current();
        let mem = self.inner.mem.read();
        f.debug_struct("Engine")
            .field("dir", &self.inner.dir)
            .field("visible_seq", &self.inner.versions.visible_seq())
            .field("memtable_size", &mem.mutable.approx_size())
            .field("memtable_entries", &mem.mutable.len())
            .field("immutable_memtables", &mem.immutables.len())
            .field("files", &version.total_files())
            .field("workers", &self.workers.len())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Engine {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    /// Sequence number of the newest write visible to new reads.
    #[must_use]
    pub fn visible_seq(&self) -> SeqNum {
        self.inner.versions.visible_seq()
    }

    /// Installs (or with `None` removes) the listener for flush and
    /// compaction events.
    pub fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        *self.inner.listener.write() = listener;
    }

    /// Receives the number of every version installed from now on.
    pub fn subscribe_versions(&self) -> Receiver<u64> {
        self.inner.versions.subscribe()
    }

    /// Runs automatic compactions on the calling thread until no level
    /// needs one. Works even when automatic compactions are disabled.
    pub fn compact(&self) -> Result<()> {
        self.inner.compact_until_settled()
    }

    /// Compacts every file overlapping `[start, end]` into the deepest
    /// level holding data in that range.
    pub fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.inner.compact_range(start, end)
    }

    /// Flushes what is left in memory, cancels running compactions and
    /// stops the background threads. Further operations fail with
    /// [`Error::Closed`]. Called by `Drop`.
    pub fn close(&mut self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let flushed = self.flush();
        self.inner.closed.store(true, Ordering::Release);
        self.inner.compactions.lock().cancel_all();
        self.inner.compaction_done.notify_all();
        drop(self.inner.jobs.lock().take());
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                warn!("background worker panicked");
            }
        }
        let _ = self.inner.cleanup.send(CleanupJob::Stop);
        if let Some(c) = self.cleaner.take() {
            if c.join().is_err() {
                warn!("cleanup thread panicked");
            }
        }
        info!(dir = %self.inner.dir.display(), "engine closed");
        if let Err(e) = &flushed {
            debug!(error = %e, "final flush failed, writes stay in the WAL");
        }
        flushed
    }
}

/// Best-effort close on drop.
///
/// Errors are logged and otherwise ignored: anything not flushed is still
/// in the WAL and is recovered on the next open.
impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing engine");
        }
    }
}

#[cfg(test)]
mod tests;
