//! Object storage provider.
//!
//! Sorted files and blob files are written and read through the
//! [`ObjectStore`] trait so the table code never touches paths. The local
//! implementation, [`FsObjectStore`], keeps one file per object in a
//! directory and publishes new objects crash-safely:
//!
//! ```text
//! create("000007.sst")  ->  writes 000007.sst.tmp
//! finish()              ->  fsync, rename to 000007.sst, fsync directory
//! abort()               ->  removes 000007.sst.tmp
//! ```
//!
//! A crash between create and finish leaves a `.tmp` object behind; those
//! are removed when the store is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base::corruption;
use parking_lot::Mutex;
use tracing::{debug, warn};

const TMP_SUFFIX: &str = ".tmp";

/// A published object opened for reading.
pub trait Readable: Send + Sync {
    /// Reads exactly `len` bytes at `offset`. Reading past the end of the
    /// object is corruption.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn size(&self) -> u64;
}

/// An object being written. Exactly one of [`finish`](Writable::finish) or
/// [`abort`](Writable::abort) must be called.
pub trait Writable: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Makes the object durable and visible under its name.
    fn finish(self: Box<Self>) -> Result<()>;
    /// Discards everything written so far.
    fn abort(self: Box<Self>);
}

pub trait ObjectStore: Send + Sync {
    fn create(&self, name: &str) -> Result<Box<dyn Writable>>;
    fn open(&self, name: &str) -> Result<Arc<dyn Readable>>;
    fn remove(&self, name: &str) -> Result<()>;
    /// Names of every published object.
    fn list(&self) -> Result<Vec<String>>;
}

/// Objects stored as files in one directory.
#[derive(Debug)]
pub struct FsObjectStore {
    dir: PathBuf,
}

impl FsObjectStore {
    /// Opens (creating if needed) the directory and removes temporary
    /// objects left by an interrupted writer.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create object directory {}", dir.display()))?;
        let store = Self { dir };
        store.remove_temporaries()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn remove_temporaries(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TMP_SUFFIX) {
                debug!(object = %name, "removing temporary object");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(object = %name, error = %e, "failed to remove temporary object");
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn create(&self, name: &str) -> Result<Box<dyn Writable>> {
        let final_path = self.path(name);
        let tmp_path = self.path(&format!("{}{}", name, TMP_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("cannot create {}", tmp_path.display()))?;
        Ok(Box::new(FsWritable {
            file: BufWriter::new(file),
            tmp_path,
            final_path,
        }))
    }

    fn open(&self, name: &str) -> Result<Arc<dyn Readable>> {
        let path = self.path(name);
        let file = File::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(Arc::new(FsReadable {
            file: Mutex::new(file),
            size,
        }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        fs::remove_file(&path).with_context(|| format!("cannot remove {}", path.display()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TMP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Persistent file handle, wrapped in a `Mutex` so reads can go through
/// a shared reference.
struct FsReadable {
    file: Mutex<File>,
    size: u64,
}

impl Readable for FsReadable {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(corruption(format!(
                "read of {} bytes at {} past end of object ({} bytes)",
                len, offset, self.size
            )));
        }
        let mut buf = vec![0u8; len];
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

struct FsWritable {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl Writable for FsWritable {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let FsWritable {
            file,
            tmp_path,
            final_path,
        } = *self;
        // Flush BufWriter, then sync the underlying file
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!("cannot publish {}", final_path.display())
        })?;

        // A crash after rename but before the directory sync can lose the entry.
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let FsWritable { file, tmp_path, .. } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove aborted object");
        }
    }
}
