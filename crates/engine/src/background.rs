//! Background threads: flush/compaction workers and the obsolete-file
//! cleaner.
//!
//! ```text
//! writes ── Job::Flush ─────┐
//! flushes ─ Job::MaybeCompact ┤──► crossbeam channel ──► worker 0..N
//!
//! Version::drop ── CleanupJob::Obsolete ──► cleaner ──► remove + evict
//! ```
//!
//! Workers and the cleaner exit once their channel is closed (or, for the
//! cleaner, on [`CleanupJob::Stop`]).

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use base::{classify, Error};
use crossbeam_channel::Receiver;
use sstable::ObjectStore;
use tracing::{debug, error, warn};

use crate::file_cache::FileCache;
use crate::filenames::{name_of, FileType};
use crate::EngineInner;

/// Work handed to the cleanup thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanupJob {
    /// The file is no longer referenced by any version or iterator.
    Obsolete(FileType, u64),
    Stop,
}

/// Work handed to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Flush,
    MaybeCompact,
}

pub(crate) fn spawn_cleaner(
    dir: PathBuf,
    store: Arc<dyn ObjectStore>,
    cache: Arc<FileCache>,
    rx: Receiver<CleanupJob>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("shoal-cleaner".into())
        .spawn(move || {
            for job in rx.iter() {
                let (file_type, num) = match job {
                    CleanupJob::Obsolete(t, n) => (t, n),
                    CleanupJob::Stop => break,
                };
                let name = name_of(file_type, num);
                let res = match file_type {
                    FileType::Table | FileType::Blob => {
                        cache.evict(num);
                        store.remove(&name)
                    }
                    FileType::Log | FileType::Manifest => {
                        fs::remove_file(dir.join(&name)).map_err(Into::into)
                    }
                };
                match res {
                    Ok(()) => debug!(file = %name, "deleted obsolete file"),
                    Err(e) => warn!(file = %name, error = %e, "failed to delete obsolete file"),
                }
            }
        })?;
    Ok(handle)
}

pub(crate) fn spawn_workers(
    inner: &Arc<EngineInner>,
    rx: Receiver<Job>,
    count: usize,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count.max(1) {
        let inner = Arc::clone(inner);
        let rx = rx.clone();
        let handle = thread::Builder::new()
            .name(format!("shoal-worker-{}", i))
            .spawn(move || {
                for job in rx.iter() {
                    if inner.is_closed() {
                        break;
                    }
                    let res = match job {
                        Job::Flush => inner.flush_immutables(),
                        Job::MaybeCompact => inner.maybe_compact(),
                    };
                    if let Err(e) = res {
                        report(&inner, job, &e);
                    }
                }
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Logs a failed background job. Invariant violations stop the engine
/// from taking further writes and compactions.
fn report(inner: &EngineInner, job: Job, e: &anyhow::Error) {
    match classify(e) {
        Some(Error::Invariant(_)) => {
            error!(?job, error = %e, "background job hit an invariant violation");
            inner.set_background_error(e);
        }
        Some(Error::Cancelled) | Some(Error::Closed) => {
            debug!(?job, "background job cancelled");
        }
        _ => warn!(?job, error = %e, "background job failed"),
    }
}
