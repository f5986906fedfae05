mod merge_tests;
mod table_tests;

use std::sync::Arc;

use anyhow::Result;
use base::{InternalIterator, InternalKey, InternalKeyKind, InternalValue, DEFAULT_COMPARER};

use crate::*;

// -------------------- Shared helpers --------------------

pub(crate) fn ikey(user_key: &str, seq: u64, kind: InternalKeyKind) -> InternalKey {
    InternalKey::new(user_key.as_bytes().to_vec(), seq, kind)
}

pub(crate) fn set(user_key: &str, seq: u64) -> InternalKey {
    ikey(user_key, seq, InternalKeyKind::Set)
}

/// Writes `points` (already sorted) into a new table and opens it.
pub(crate) fn write_table(
    store: &FsObjectStore,
    name: &str,
    points: &[(InternalKey, &str)],
    block_size: usize,
) -> Result<(WriterMetadata, Arc<TableReader>)> {
    let mut w = TableWriter::new(
        store.create(name)?,
        WriterOptions::new(&DEFAULT_COMPARER, block_size),
    );
    for (k, v) in points {
        w.add(k, v.as_bytes())?;
    }
    let meta = w.finish()?;
    let reader = Arc::new(TableReader::open(store.open(name)?, &DEFAULT_COMPARER)?);
    Ok((meta, reader))
}

pub(crate) fn render(kv: &base::InternalKv) -> String {
    match &kv.value {
        InternalValue::Inline(v) => format!("{}={}", kv.key, String::from_utf8_lossy(v)),
        InternalValue::Blob(b) => format!("{}=blob({},{})", kv.key, b.file_num, b.handle.value_len),
    }
}

pub(crate) fn collect_forward(it: &mut dyn InternalIterator) -> Result<Vec<String>> {
    let mut out = Vec::new();
    it.first()?;
    while let Some(kv) = it.current() {
        out.push(render(kv));
        it.next()?;
    }
    Ok(out)
}

pub(crate) fn collect_backward(it: &mut dyn InternalIterator) -> Result<Vec<String>> {
    let mut out = Vec::new();
    it.last()?;
    while let Some(kv) = it.current() {
        out.push(render(kv));
        it.prev()?;
    }
    Ok(out)
}
