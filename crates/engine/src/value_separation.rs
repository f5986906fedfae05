//! Value separation: moving large values out of sorted files into blob
//! files.
//!
//! Every flush and compaction hands each surviving point key to a
//! [`ValueSeparation`] policy, which either writes it into the table as is
//! or stores a blob handle in its place:
//!
//! ```text
//! WriteNewBlobFiles        value >= minimum_size ──► blob file (one per output)
//!                          table gets handle(ref 0, block, offset, len)
//!
//! PreserveBlobReferences   blob handle in ──► same handle out, its blob file
//!                          renumbered to a dense per-output reference index
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use base::{
    invariant, Comparer, InlineHandle, InternalKeyKind, InternalKv, InternalValue,
    ShortAttributeExtractor, ValueFetcher,
};
use config::{Options, UserKeyPrefixBound};
use sstable::{BlobFileWriter, TableWriter, Writable};
use tracing::debug;

use crate::file_metadata::{BlobFileMetadata, BlobReference};

/// What a policy reports when an output table is finished.
#[derive(Debug, Default)]
pub struct ValueSeparationMetadata {
    /// Blob files referenced by the output, indexed by reference index.
    pub blob_references: Vec<BlobReference>,
    pub reference_size: u64,
    pub reference_depth: usize,
    /// The blob file written alongside the output, if any.
    pub new_blob_file: Option<BlobFileMetadata>,
}

pub trait ValueSeparationPolicy {
    /// Writes `kv` into `writer`, possibly separating its value.
    fn add(&mut self, writer: &mut TableWriter, kv: &InternalKv) -> Result<()>;

    /// Bytes written to a blob file for the current output.
    fn estimated_file_size(&self) -> u64;

    /// Value bytes the current output references in blob files.
    fn estimated_reference_size(&self) -> u64;

    /// Closes out the current output table.
    fn finish_output(&mut self) -> Result<ValueSeparationMetadata>;

    /// Discards any partially written blob file.
    fn abort(&mut self) {}
}

/// Creates the object for a new blob file and returns its file number.
pub type BlobObjectFactory = Box<dyn FnMut() -> Result<(u64, Box<dyn Writable>)> + Send>;

pub struct WriteNewBlobFiles {
    cmp: &'static Comparer,
    fetcher: Arc<dyn ValueFetcher>,
    new_blob_object: BlobObjectFactory,
    short_attr_extractor: Option<ShortAttributeExtractor>,
    block_size: usize,
    minimum_size: usize,
    required_in_place: UserKeyPrefixBound,
    writer: Option<(u64, BlobFileWriter)>,
}

impl WriteNewBlobFiles {
    pub fn new(opts: &Options, fetcher: Arc<dyn ValueFetcher>, new_blob_object: BlobObjectFactory) -> Self {
        Self {
            cmp: opts.comparer,
            fetcher,
            new_blob_object,
            short_attr_extractor: opts.short_attribute_extractor,
            block_size: opts.value_separation.blob_block_size,
            minimum_size: opts.value_separation.minimum_size,
            required_in_place: opts.value_separation.required_in_place.clone(),
            writer: None,
        }
    }

    /// True if `key` must keep its value in the table. Keys arrive in
    /// order, so the bound is dropped once passed.
    fn keep_in_place(&mut self, key: &[u8]) -> bool {
        if self.required_in_place.is_empty() {
            return false;
        }
        let prefix = self.cmp.prefix(key);
        if self.cmp.cmp(&self.required_in_place.upper, prefix) != Ordering::Greater {
            self.required_in_place = UserKeyPrefixBound::default();
            return false;
        }
        self.cmp.cmp(prefix, &self.required_in_place.lower) != Ordering::Less
    }
}

impl ValueSeparationPolicy for WriteNewBlobFiles {
    fn add(&mut self, writer: &mut TableWriter, kv: &InternalKv) -> Result<()> {
        let value = kv.value.fetch(self.fetcher.as_ref())?;
        if kv.key.kind() != InternalKeyKind::Set
            || value.len() < self.minimum_size
            || self.keep_in_place(&kv.key.user_key)
        {
            return writer.add(&kv.key, &value);
        }

        let short_attr = match self.short_attr_extractor {
            Some(extract) => {
                let prefix_len = self.cmp.prefix(&kv.key.user_key).len();
                extract(&kv.key.user_key, prefix_len, &value)
            }
            None => 0,
        };
        if self.writer.is_none() {
            let (num, out) = (self.new_blob_object)()?;
            debug!(file_num = num, "created blob file");
            self.writer = Some((num, BlobFileWriter::new(out, self.block_size)));
        }
        let Some((_, blob)) = self.writer.as_mut() else {
            return Err(invariant("blob writer missing"));
        };
        let handle = blob.add(&value)?;
        writer.add_with_blob_handle(
            &kv.key,
            InlineHandle {
                reference_index: 0,
                handle,
            },
            short_attr,
        )
    }

    fn estimated_file_size(&self) -> u64 {
        self.writer
            .as_ref()
            .map_or(0, |(_, w)| w.estimated_size())
    }

    fn estimated_reference_size(&self) -> u64 {
        self.estimated_file_size()
    }

    fn finish_output(&mut self) -> Result<ValueSeparationMetadata> {
        let Some((num, writer)) = self.writer.take() else {
            return Ok(ValueSeparationMetadata::default());
        };
        let stats = writer.close()?;
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(ValueSeparationMetadata {
            blob_references: vec![BlobReference {
                file_num: num,
                value_size: stats.uncompressed_value_bytes,
            }],
            reference_size: stats.uncompressed_value_bytes,
            reference_depth: 1,
            new_blob_file: Some(BlobFileMetadata::new(
                num,
                stats.file_len,
                stats.uncompressed_value_bytes,
                creation_time,
            )),
        })
    }

    fn abort(&mut self) {
        if let Some((_, w)) = self.writer.take() {
            w.abort();
        }
    }
}

pub struct PreserveBlobReferences {
    input_blob_files: BTreeMap<u64, Arc<BlobFileMetadata>>,
    output_depth: usize,
    current: Vec<BlobReference>,
    total_value_size: u64,
}

impl PreserveBlobReferences {
    /// `input_blob_files` are the blob files referenced by the inputs;
    /// `output_depth` is the depth derived from the input levels.
    pub fn new(input_blob_files: BTreeMap<u64, Arc<BlobFileMetadata>>, output_depth: usize) -> Self {
        Self {
            input_blob_files,
            output_depth,
            current: Vec::new(),
            total_value_size: 0,
        }
    }
}

impl ValueSeparationPolicy for PreserveBlobReferences {
    fn add(&mut self, writer: &mut TableWriter, kv: &InternalKv) -> Result<()> {
        let blob = match &kv.value {
            InternalValue::Inline(v) => return writer.add(&kv.key, v),
            InternalValue::Blob(b) => b,
        };
        let index = match self.current.iter().position(|r| r.file_num == blob.file_num) {
            Some(i) => i,
            None => {
                if !self.input_blob_files.contains_key(&blob.file_num) {
                    return Err(invariant(format!(
                        "blob file {:06} not found among input tables",
                        blob.file_num
                    )));
                }
                self.current.push(BlobReference {
                    file_num: blob.file_num,
                    value_size: 0,
                });
                self.current.len() - 1
            }
        };
        writer.add_with_blob_handle(
            &kv.key,
            InlineHandle {
                reference_index: index as u32,
                handle: blob.handle,
            },
            blob.short_attr,
        )?;
        let len = blob.handle.value_len as u64;
        self.current[index].value_size += len;
        self.total_value_size += len;
        Ok(())
    }

    fn estimated_file_size(&self) -> u64 {
        0
    }

    fn estimated_reference_size(&self) -> u64 {
        self.total_value_size
    }

    fn finish_output(&mut self) -> Result<ValueSeparationMetadata> {
        let references = std::mem::take(&mut self.current);
        self.total_value_size = 0;
        let reference_size = references.iter().map(|r| r.value_size).sum();
        Ok(ValueSeparationMetadata {
            reference_depth: self.output_depth.min(references.len()),
            blob_references: references,
            reference_size,
            new_blob_file: None,
        })
    }
}

pub enum ValueSeparation {
    WriteNewBlobFiles(WriteNewBlobFiles),
    PreserveBlobReferences(PreserveBlobReferences),
}

impl ValueSeparationPolicy for ValueSeparation {
    fn add(&mut self, writer: &mut TableWriter, kv: &InternalKv) -> Result<()> {
        match self {
            Self::WriteNewBlobFiles(p) => p.add(writer, kv),
            Self::PreserveBlobReferences(p) => p.add(writer, kv),
        }
    }

    fn estimated_file_size(&self) -> u64 {
        match self {
            Self::WriteNewBlobFiles(p) => p.estimated_file_size(),
            Self::PreserveBlobReferences(p) => p.estimated_file_size(),
        }
    }

    fn estimated_reference_size(&self) -> u64 {
        match self {
            Self::WriteNewBlobFiles(p) => p.estimated_reference_size(),
            Self::PreserveBlobReferences(p) => p.estimated_reference_size(),
        }
    }

    fn finish_output(&mut self) -> Result<ValueSeparationMetadata> {
        match self {
            Self::WriteNewBlobFiles(p) => p.finish_output(),
            Self::PreserveBlobReferences(p) => p.finish_output(),
        }
    }

    fn abort(&mut self) {
        match self {
            Self::WriteNewBlobFiles(p) => p.abort(),
            Self::PreserveBlobReferences(p) => p.abort(),
        }
    }
}

impl std::fmt::Debug for ValueSeparation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteNewBlobFiles(p) => f
                .debug_struct("WriteNewBlobFiles")
                .field("minimum_size", &p.minimum_size)
                .finish(),
            Self::PreserveBlobReferences(p) => f
                .debug_struct("PreserveBlobReferences")
                .field("inputs", &p.input_blob_files.len())
                .field("depth", &p.output_depth)
                .finish(),
        }
    }
}
