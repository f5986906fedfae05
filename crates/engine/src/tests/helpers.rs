use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::{Event, EventListener, Iterator, Options};

/// Options for tests: tiny memtables, no background compactions unless a
/// test turns them back on.
pub fn test_options() -> Options {
    Options {
        memtable_size: 64 * 1024,
        wal_sync: false,
        target_file_size: 4 * 1024,
        lbase_max_bytes: 16 * 1024,
        block_size: 512,
        disable_automatic_compactions: true,
        ..Options::default()
    }
}

pub fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

/// Every point key and value from the iterator's current position on.
pub fn drain(it: &mut Iterator, mut valid: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    while valid {
        if let (Some(k), Some(v)) = (it.key(), it.value()) {
            out.push((k.to_vec(), v.to_vec()));
        }
        valid = it.next()?;
    }
    Ok(out)
}

pub fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
    (k.as_bytes().to_vec(), v.as_bytes().to_vec())
}

/// Records every event it receives.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
}

impl EventListener for Recorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

pub fn recorder() -> Arc<Recorder> {
    Arc::new(Recorder::default())
}
