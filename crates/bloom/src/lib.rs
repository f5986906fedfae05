//! # Bloom - table filters
//!
//! Every table may carry a bloom filter over the prefixes of its point
//! keys. A point lookup probes the filter with the prefix of the key it
//! looks for: a negative answer is certain and the table is skipped
//! without touching its index or data blocks, a positive one may be a
//! false positive.
//!
//! Filters are built with a [`FilterBuilder`] while a table is written and
//! stored in the table's `shoal.filter.bloom` block:
//!
//! ```text
//! [bit array: n bytes][num_probes: u8]
//! ```
//!
//! Probes use double hashing over a single 64-bit FNV-1a hash:
//! `h(i) = h + i * delta` where `delta` is `h` rotated by 17 bits.
//!
//! ## Example
//!
//! ```rust
//! use bloom::{BloomFilter, FilterBuilder};
//!
//! let mut b = FilterBuilder::new(10);
//! b.add(b"apple");
//! b.add(b"banana");
//! let block = b.finish();
//!
//! let filter = BloomFilter::decode(&block).unwrap();
//! assert!(filter.may_contain(b"apple"));
//! ```

use thiserror::Error;

/// Largest probe count a decoded filter may use.
const MAX_PROBES: u8 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter block too short: {0} bytes")]
    TooShort(usize),
    #[error("filter block uses {0} probes")]
    BadProbes(u8),
}

/// Accumulates key hashes for one table's filter.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    bits_per_key: usize,
    hashes: Vec<u64>,
}

impl FilterBuilder {
    /// `bits_per_key` trades space for accuracy; 10 bits give roughly a 1%
    /// false-positive rate.
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key: bits_per_key.max(1),
            hashes: Vec::new(),
        }
    }

    /// Adds a key. Adding the same key twice in a row is a no-op, so the
    /// prefixes of sorted versioned keys can be fed in directly.
    pub fn add(&mut self, key: &[u8]) {
        let h = hash(key);
        if self.hashes.last() != Some(&h) {
            self.hashes.push(h);
        }
    }

    /// Number of distinct keys added so far.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Builds the encoded filter block.
    pub fn finish(self) -> Vec<u8> {
        let num_probes = probes_for(self.bits_per_key);
        let num_bits = (self.hashes.len() * self.bits_per_key).max(64);
        let num_bytes = num_bits.div_ceil(8);
        let num_bits = (num_bytes * 8) as u64;

        let mut out = vec![0u8; num_bytes + 1];
        for h in self.hashes {
            for bit in probe_bits(h, num_probes, num_bits) {
                out[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        out[num_bytes] = num_probes;
        out
    }
}

/// A decoded filter block.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_probes: u8,
}

impl BloomFilter {
    pub fn decode(block: &[u8]) -> Result<Self, FilterError> {
        let Some((&num_probes, bits)) = block.split_last() else {
            return Err(FilterError::TooShort(block.len()));
        };
        if bits.is_empty() {
            return Err(FilterError::TooShort(block.len()));
        }
        if num_probes == 0 || num_probes > MAX_PROBES {
            return Err(FilterError::BadProbes(num_probes));
        }
        Ok(Self {
            bits: bits.to_vec(),
            num_probes,
        })
    }

    /// False only if `key` was certainly never added.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let num_bits = (self.bits.len() * 8) as u64;
        probe_bits(hash(key), self.num_probes, num_bits)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    #[must_use]
    pub fn num_probes(&self) -> u8 {
        self.num_probes
    }

    /// Size of the bit array in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bits.len()
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bytes", &self.bits.len())
            .field("num_probes", &self.num_probes)
            .finish()
    }
}

/// `bits_per_key * ln(2)`, clamped to `[1, MAX_PROBES]`.
fn probes_for(bits_per_key: usize) -> u8 {
    let k = (bits_per_key as f64 * std::f64::consts::LN_2) as usize;
    k.clamp(1, MAX_PROBES as usize) as u8
}

fn probe_bits(h: u64, num_probes: u8, num_bits: u64) -> impl Iterator<Item = u64> {
    let delta = h.rotate_left(17);
    (0..num_probes as u64).map(move |i| h.wrapping_add(i.wrapping_mul(delta)) % num_bits)
}

/// FNV-1a, 64 bit.
fn hash(data: &[u8]) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
