//! Names of the objects in a database directory.
//!
//! ```text
//! 000007.sst       sorted table
//! 000008.blob      blob file
//! 000009.log       write-ahead log
//! MANIFEST-000003  version edit log
//! CURRENT          names the live manifest
//! ```
//!
//! Tables, blob files, logs and manifests share one file-number space.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use base::corruption;

pub const CURRENT: &str = "CURRENT";
const CURRENT_TMP: &str = "CURRENT.tmp";
const MANIFEST_PREFIX: &str = "MANIFEST-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Table,
    Blob,
    Log,
    Manifest,
}

pub fn table_name(num: u64) -> String {
    format!("{:06}.sst", num)
}

pub fn blob_name(num: u64) -> String {
    format!("{:06}.blob", num)
}

pub fn log_name(num: u64) -> String {
    format!("{:06}.log", num)
}

pub fn manifest_name(num: u64) -> String {
    format!("{}{:06}", MANIFEST_PREFIX, num)
}

pub fn name_of(file_type: FileType, num: u64) -> String {
    match file_type {
        FileType::Table => table_name(num),
        FileType::Blob => blob_name(num),
        FileType::Log => log_name(num),
        FileType::Manifest => manifest_name(num),
    }
}

/// Recognises a database object name. `CURRENT` and unrelated files
/// return `None`.
pub fn parse(name: &str) -> Option<(FileType, u64)> {
    if let Some(num) = name.strip_prefix(MANIFEST_PREFIX) {
        return num.parse().ok().map(|n| (FileType::Manifest, n));
    }
    let (stem, ext) = name.split_once('.')?;
    let num = stem.parse().ok()?;
    let file_type = match ext {
        "sst" => FileType::Table,
        "blob" => FileType::Blob,
        "log" => FileType::Log,
        _ => return None,
    };
    Some((file_type, num))
}

/// Points `CURRENT` at manifest `num`.
///
/// The new contents are written to a temporary file, synced and renamed
/// over `CURRENT`, so a crash leaves either the old or the new pointer.
pub fn set_current(dir: &Path, num: u64) -> Result<()> {
    let tmp = dir.join(CURRENT_TMP);
    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        writeln!(f, "{}", manifest_name(num))?;
        f.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CURRENT)).context("failed to install CURRENT")?;
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

/// Manifest number named by `CURRENT`, or `None` for a new database.
pub fn read_current(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(CURRENT);
    let contents = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("failed to read CURRENT"),
    };
    match parse(contents.trim_end()) {
        Some((FileType::Manifest, num)) => Ok(Some(num)),
        _ => Err(corruption(format!(
            "CURRENT does not name a manifest: {:?}",
            contents
        ))),
    }
}
