//! Write path: validated point and span writes, memtable rotation and
//! flushes.
//!
//! Every mutation is first appended to the WAL, then applied to the
//! mutable memtable. A full memtable is rotated: the engine switches to a
//! fresh WAL and memtable and a worker flushes the old one into an L0
//! table.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use base::{invalid_argument, InternalKeyKind, SeqNum};
use config::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use memtable::Memtable;
use tracing::{debug, info, instrument, warn};
use wal::{WalRecord, WalWriter};

use crate::background::{CleanupJob, Job};
use crate::compaction_iter::{CompactionIter, ElideFn};
use crate::executor::OutputWriter;
use crate::filenames::{log_name, FileType};
use crate::picker;
use crate::value_separation::{PreserveBlobReferences, ValueSeparation, WriteNewBlobFiles};
use crate::version_edit::VersionEdit;
use crate::{Engine, EngineInner, Event};

fn check_key(what: &str, key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(invalid_argument(format!("{} must not be empty", what)));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(invalid_argument(format!(
            "{} too large: {} bytes (max {})",
            what,
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(invalid_argument(format!(
            "value too large: {} bytes (max {})",
            value.len(),
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

impl Engine {
    /// Sets `key` to `value`.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key("key", key)?;
        check_value(value)?;
        self.inner.apply_point(InternalKeyKind::Set, key, value)
    }

    /// Deletes `key`, hiding every older version of it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        check_key("key", key)?;
        self.inner.apply_point(InternalKeyKind::Delete, key, &[])
    }

    /// Deletes the single most recent `set` of `key`.
    ///
    /// Only defined when the key was set exactly once since it was last
    /// deleted and never merged; see
    /// [`Iterator::can_deterministically_single_delete`](crate::Iterator::can_deterministically_single_delete).
    pub fn single_delete(&self, key: &[u8]) -> Result<()> {
        check_key("key", key)?;
        self.inner.apply_point(InternalKeyKind::SingleDelete, key, &[])
    }

    /// Records a merge operand, folded by the configured merger on read.
    pub fn merge(&self, key: &[u8], operand: &[u8]) -> Result<()> {
        check_key("key", key)?;
        check_value(operand)?;
        self.inner.apply_point(InternalKeyKind::Merge, key, operand)
    }

    /// Deletes every point key in `[start, end)`.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.inner
            .apply_span(InternalKeyKind::RangeDelete, start, end, &[], &[])
    }

    /// Sets the range key `[start, end)` at `suffix` to `value`.
    pub fn range_key_set(&self, start: &[u8], end: &[u8], suffix: &[u8], value: &[u8]) -> Result<()> {
        check_value(value)?;
        self.inner
            .apply_span(InternalKeyKind::RangeKeySet, start, end, suffix, value)
    }

    /// Removes the range key `[start, end)` at `suffix`.
    pub fn range_key_unset(&self, start: &[u8], end: &[u8], suffix: &[u8]) -> Result<()> {
        self.inner
            .apply_span(InternalKeyKind::RangeKeyUnset, start, end, suffix, &[])
    }

    /// Removes every range key within `[start, end)`, whatever its suffix.
    pub fn range_key_delete(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.inner
            .apply_span(InternalKeyKind::RangeKeyDelete, start, end, &[], &[])
    }

    /// Flushes every memtable, including the mutable one, to L0 on the
    /// calling thread.
    ///
    /// This is a no-op if nothing is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure while writing the table, the WAL or
    /// the manifest; buffered writes stay in the WAL.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_writable()?;
        {
            let mut wal = self.inner.wal.lock();
            let buffered = !self.inner.mem.read().mutable.is_empty();
            if buffered {
                self.inner.rotate_memtable(&mut wal)?;
            }
        }
        self.inner.flush_immutables()
    }
}

impl EngineInner {
    fn apply_point(&self, kind: InternalKeyKind, key: &[u8], value: &[u8]) -> Result<()> {
        self.commit(|seq| WalRecord::Point {
            seq,
            kind,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn apply_span(
        &self,
        kind: InternalKeyKind,
        start: &[u8],
        end: &[u8],
        suffix: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let cmp = self.opts.comparer;
        check_key("range start", start)?;
        check_key("range end", end)?;
        if cmp.cmp(start, end) != std::cmp::Ordering::Less {
            return Err(invalid_argument("range start must sort before range end"));
        }
        if !suffix.is_empty() && !cmp.prefix(suffix).is_empty() {
            return Err(invalid_argument(format!(
                "\"{}\" is not a suffix under {}",
                suffix.escape_ascii(),
                cmp.name
            )));
        }
        self.commit(|seq| WalRecord::Span {
            seq,
            kind,
            start: start.to_vec(),
            end: end.to_vec(),
            suffix: suffix.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Assigns a sequence number, logs the record and applies it to the
    /// mutable memtable.
    ///
    /// # Steps
    ///
    /// 1. Take the commit lock and allocate the next sequence number.
    /// 2. Append the record to the WAL.
    /// 3. Insert into the mutable memtable.
    /// 4. Publish the sequence number to readers.
    /// 5. Rotate the memtable if it reached `memtable_size`.
    fn commit(&self, record: impl FnOnce(SeqNum) -> WalRecord) -> Result<()> {
        self.check_writable()?;
        let mut wal = self.wal.lock();
        let seq = self.versions.alloc_seq(1);
        let rec = record(seq);
        wal.append(&rec)
            .map_err(|e| anyhow!(e).context("failed to append to the WAL"))?;

        let full = {
            let m = self.mem.read();
            match &rec {
                WalRecord::Point { kind, key, value, .. } => m.mutable.add(seq, *kind, key, value),
                WalRecord::Span {
                    kind,
                    start,
                    end,
                    suffix,
                    value,
                    ..
                } => m.mutable.add_span(seq, *kind, start, end, suffix, value),
            }
            m.mutable.approx_size() >= self.opts.memtable_size
        };
        self.versions.advance_visible(seq);

        if full {
            // The write is already in the WAL; a failed rotation is
            // retried by the next write.
            if let Err(e) = self.rotate_memtable(&mut wal) {
                warn!(error = %e, "memtable rotation failed");
            }
        }
        Ok(())
    }

    /// Switches to a fresh WAL and memtable, queueing the old memtable for
    /// a flush. Called with the commit lock held.
    pub(crate) fn rotate_memtable(&self, wal: &mut WalWriter) -> Result<()> {
        let num = self.versions.new_file_num();
        let fresh = WalWriter::create(self.dir.join(log_name(num)), self.opts.wal_sync)
            .map_err(|e| anyhow!(e).context("failed to create WAL"))?;
        wal.sync_to_disk()
            .map_err(|e| anyhow!(e).context("failed to sync the WAL"))?;
        *wal = fresh;

        let mut m = self.mem.write();
        let full = std::mem::replace(&mut m.mutable, Arc::new(Memtable::new(self.opts.comparer)));
        let old_log = std::mem::replace(&mut m.log_num, num);
        debug!(
            entries = full.len(),
            bytes = full.approx_size(),
            old_log,
            new_log = num,
            "rotated memtable"
        );
        m.immutables.push((full, old_log));
        drop(m);

        self.emit(Event::FlushNeeded);
        self.schedule(Job::Flush);
        Ok(())
    }

    /// Flushes immutable memtables, oldest first, until none is left.
    #[instrument(skip(self))]
    pub(crate) fn flush_immutables(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        loop {
            let next = {
                let m = self.mem.read();
                m.immutables.first().map(|(mem, log)| {
                    let next_log = m.immutables.get(1).map_or(m.log_num, |(_, l)| *l);
                    (Arc::clone(mem), *log, next_log)
                })
            };
            let Some((mem, log_num, next_log)) = next else {
                return Ok(());
            };
            self.check_writable()?;
            self.flush_memtable(&mem, log_num, next_log)?;
        }
    }

    /// Writes one memtable into a single L0 table and records that its WAL
    /// is no longer needed.
    fn flush_memtable(&self, mem: &Arc<Memtable>, log_num: u64, next_log: u64) -> Result<()> {
        let started = Instant::now();
        let cmp = self.opts.comparer;
        let version = self.versions.current();

        let below = Arc::clone(&version);
        let elide: ElideFn = Box::new(move |s, e| !below.overlaps_below(0, s, e));
        let iter = CompactionIter::new(
            cmp,
            self.opts.merger,
            Arc::clone(&self.cache) as Arc<dyn base::ValueFetcher>,
            Box::new(mem.iter()),
            self.snapshots.to_vec(),
            mem.range_dels(),
            mem.range_keys(),
            elide,
        );
        let policy = if self.opts.value_separation.enabled {
            ValueSeparation::WriteNewBlobFiles(WriteNewBlobFiles::new(
                &self.opts,
                Arc::clone(&self.cache) as Arc<dyn base::ValueFetcher>,
                self.blob_object_factory(),
            ))
        } else {
            ValueSeparation::PreserveBlobReferences(PreserveBlobReferences::new(BTreeMap::new(), 0))
        };
        let result = OutputWriter::new(
            &self.opts,
            Arc::clone(&self.store),
            self.versions.file_numbers(),
            policy,
            &[],
            Vec::new(),
            None,
        )
        .without_splitting()
        .run(iter)?;

        let mut edit = VersionEdit {
            log_number: Some(next_log),
            ..VersionEdit::default()
        };
        for t in &result.tables {
            edit.add_file(0, Arc::clone(t));
        }
        edit.new_blob_files = result.blob_files.clone();

        let version = match self.versions.log_and_apply(edit) {
            Ok(v) => v,
            Err(e) => {
                result.remove_outputs(self.store.as_ref());
                return Err(e);
            }
        };
        {
            let mut m = self.mem.write();
            if m.immutables.first().is_some_and(|(t, _)| Arc::ptr_eq(t, mem)) {
                m.immutables.remove(0);
            }
        }
        if self.cleanup.send(CleanupJob::Obsolete(FileType::Log, log_num)).is_err() {
            debug!(log = log_num, "cleanup thread gone, leaving flushed WAL");
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flush_bytes
            .fetch_add(result.bytes_written, Ordering::Relaxed);
        info!(
            log = log_num,
            entries = mem.len(),
            tables = result.tables.len(),
            blob_files = result.blob_files.len(),
            bytes = result.bytes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed memtable"
        );
        self.emit(Event::FlushEnd {
            tables: result.tables.len(),
            bytes: result.bytes_written,
        });

        if picker::level_scores(&version, &self.opts)
            .iter()
            .any(|&(_, score)| score >= 1.0)
        {
            self.emit(Event::CompactionNeeded);
            if !self.opts.disable_automatic_compactions {
                self.schedule(Job::MaybeCompact);
            }
        }
        Ok(())
    }
}
