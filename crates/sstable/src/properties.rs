//! Table properties: named counters stored in their own block.

use anyhow::Result;
use base::corruption;
use byteorder::{ByteOrder, LittleEndian};

use crate::block::{Block, BlockBuilder};

/// Statistics recorded by the writer. Encoded as `name -> u64 LE` entries
/// sorted by name; unknown names are skipped on read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_merge_operands: u64,
    pub num_range_deletions: u64,
    pub num_range_keys: u64,
    pub num_data_blocks: u64,
    /// Distinct key prefixes in the bloom filter.
    pub num_filter_keys: u64,
    pub num_blob_handles: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    /// Bytes of values held in blob files, counted at their full length.
    pub blob_value_size: u64,
}

const NAMES: [&str; 11] = [
    "shoal.blob.handles",
    "shoal.blob.value.size",
    "shoal.data.blocks",
    "shoal.deletions",
    "shoal.entries",
    "shoal.filter.keys",
    "shoal.merge.operands",
    "shoal.range.deletions",
    "shoal.range.keys",
    "shoal.raw.key.size",
    "shoal.raw.value.size",
];

impl Properties {
    fn fields(&self) -> [u64; 11] {
        [
            self.num_blob_handles,
            self.blob_value_size,
            self.num_data_blocks,
            self.num_deletions,
            self.num_entries,
            self.num_filter_keys,
            self.num_merge_operands,
            self.num_range_deletions,
            self.num_range_keys,
            self.raw_key_size,
            self.raw_value_size,
        ]
    }

    fn field_mut(&mut self, name: &[u8]) -> Option<&mut u64> {
        let f = match name {
            b"shoal.blob.handles" => &mut self.num_blob_handles,
            b"shoal.blob.value.size" => &mut self.blob_value_size,
            b"shoal.data.blocks" => &mut self.num_data_blocks,
            b"shoal.deletions" => &mut self.num_deletions,
            b"shoal.entries" => &mut self.num_entries,
            b"shoal.filter.keys" => &mut self.num_filter_keys,
            b"shoal.merge.operands" => &mut self.num_merge_operands,
            b"shoal.range.deletions" => &mut self.num_range_deletions,
            b"shoal.range.keys" => &mut self.num_range_keys,
            b"shoal.raw.key.size" => &mut self.raw_key_size,
            b"shoal.raw.value.size" => &mut self.raw_value_size,
            _ => return None,
        };
        Some(f)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = BlockBuilder::new();
        for (name, v) in NAMES.iter().zip(self.fields()) {
            let mut buf = [0u8; 8];
            LittleEndian::write_u64(&mut buf, v);
            b.add(name.as_bytes(), &buf);
        }
        b.finish()
    }

    pub fn decode(block: &Block) -> Result<Properties> {
        let mut props = Properties::default();
        for (name, value) in block.iter() {
            if let Some(f) = props.field_mut(name) {
                if value.len() != 8 {
                    return Err(corruption(format!(
                        "property {} has {} bytes",
                        String::from_utf8_lossy(name),
                        value.len()
                    )));
                }
                *f = LittleEndian::read_u64(value);
            }
        }
        Ok(props)
    }
}
