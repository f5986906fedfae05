//! Snapshots pin a sequence number so reads see a fixed point in time.
//!
//! The list of live snapshots is an ordered multiset. Compactions read it
//! to split versions of a key into stripes; see
//! [`compaction_iter`](crate::compaction_iter).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use base::SeqNum;
use parking_lot::Mutex;

use crate::iterator::{self, IterOptions};
use crate::EngineInner;

#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    seqs: Mutex<BTreeMap<SeqNum, usize>>,
}

impl SnapshotList {
    pub(crate) fn acquire(&self, seq: SeqNum) {
        *self.seqs.lock().entry(seq).or_insert(0) += 1;
    }

    pub(crate) fn release(&self, seq: SeqNum) {
        let mut seqs = self.seqs.lock();
        if let Some(n) = seqs.get_mut(&seq) {
            *n -= 1;
            if *n == 0 {
                seqs.remove(&seq);
            }
        }
    }

    /// Distinct live snapshot sequence numbers, ascending.
    pub(crate) fn to_vec(&self) -> Vec<SeqNum> {
        self.seqs.lock().keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.seqs.lock().values().sum()
    }
}

/// A consistent read-only view of the engine.
///
/// Reads through a snapshot see every write with a sequence number up to
/// [`Snapshot::seq`] and nothing newer, even across flushes and
/// compactions. Dropping the snapshot releases it.
pub struct Snapshot {
    inner: Arc<EngineInner>,
    seq: SeqNum,
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        // Registered under the commit lock so no write can become visible
        // between reading the sequence number and registering it.
        let seq = inner.with_commit_lock(|| {
            let seq = inner.versions.visible_seq();
            inner.snapshots.acquire(seq);
            seq
        });
        Self { inner, seq }
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get_at(key, self.seq)
    }

    pub fn new_iter(&self, opts: IterOptions) -> Result<iterator::Iterator> {
        iterator::Iterator::new(Arc::clone(&self.inner), opts, self.seq)
    }

    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_at(start, end, self.seq)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq).finish()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.snapshots.release(self.seq);
    }
}
