//! # Config - tunables for the Shoal storage engine
//!
//! [`Options`] gathers every knob the engine reads. Defaults suit small
//! embedded databases; [`Options::from_env`] overlays `SHOAL_*`
//! environment variables the way the shell configures itself.
//!
//! ```text
//! SHOAL_MEMTABLE_KB        memtable size in KiB          (default: 4096)
//! SHOAL_WAL_SYNC           fsync every WAL append        (default: "true")
//! SHOAL_L0_TRIGGER         L0 file count trigger         (default: 4)
//! SHOAL_TARGET_FILE_KB     target output file size, KiB  (default: 2048)
//! SHOAL_AUTO_COMPACTIONS   background compactions        (default: "true")
//! SHOAL_COMPACTION_THREADS concurrent compactions        (default: 1)
//! SHOAL_MULTILEVEL         multi-level compactions       (default: "false")
//! SHOAL_VALUE_SEPARATION   separate large values         (default: "false")
//! SHOAL_BLOB_MIN_SIZE      smallest separated value      (default: 1024)
//! ```

use base::{Comparer, Merger, ShortAttributeExtractor, DEFAULT_COMPARER, DEFAULT_MERGER};
use thiserror::Error;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Errors raised while building or validating [`Options`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the engine cannot run with.
    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed.
    #[error("cannot parse {var}={value}")]
    Env { var: &'static str, value: String },
}

/// A user key prefix range `[lower, upper)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserKeyPrefixBound {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
}

impl UserKeyPrefixBound {
    pub fn is_empty(&self) -> bool {
        self.lower.is_empty() && self.upper.is_empty()
    }
}

/// Controls whether and how large values move into blob files.
#[derive(Debug, Clone)]
pub struct ValueSeparationOptions {
    pub enabled: bool,
    /// Values shorter than this stay in the sorted file.
    pub minimum_size: usize,
    /// Compactions whose inputs would need more distinct blob files than
    /// this per key range rewrite the values into new blob files.
    pub max_blob_reference_depth: usize,
    /// Target size of a blob file block.
    pub blob_block_size: usize,
    /// Keys whose prefix falls in this range keep their values in place.
    pub required_in_place: UserKeyPrefixBound,
}

impl Default for ValueSeparationOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            minimum_size: 1024,
            max_blob_reference_depth: 10,
            blob_block_size: 32 * 1024,
            required_in_place: UserKeyPrefixBound::default(),
        }
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct Options {
    pub comparer: &'static Comparer,
    pub merger: &'static Merger,
    pub short_attribute_extractor: Option<ShortAttributeExtractor>,

    /// Memtable byte size that triggers rotation and a flush.
    pub memtable_size: usize,
    /// If `true`, every WAL append is followed by `fsync`.
    pub wal_sync: bool,

    /// Number of L0 files at which L0 scores 1.0.
    pub l0_compaction_threshold: usize,
    /// Target byte size of level 1.
    pub lbase_max_bytes: u64,
    /// Each level below L1 targets this many times the level above.
    pub level_multiplier: u64,
    /// Output files are rolled once they reach this size.
    pub target_file_size: u64,
    pub max_grandparent_overlap_factor: u64,
    pub expanded_compaction_factor: u64,
    pub multilevel_compactions: bool,
    pub max_concurrent_compactions: usize,
    pub disable_automatic_compactions: bool,

    /// Uncompressed size of a data block.
    pub block_size: usize,
    /// Bloom filter bits per key prefix; 0 writes tables without a filter.
    pub bloom_bits_per_key: usize,
    /// Number of open table readers kept by the table cache.
    pub table_cache_capacity: usize,
    /// The manifest is rotated after growing past this size.
    pub max_manifest_size: u64,
    /// Run level ordering checks on every new version.
    pub paranoid_checks: bool,

    pub value_separation: ValueSeparationOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparer: &DEFAULT_COMPARER,
            merger: &DEFAULT_MERGER,
            short_attribute_extractor: None,
            memtable_size: 4 * 1024 * 1024,
            wal_sync: true,
            l0_compaction_threshold: 4,
            lbase_max_bytes: 64 * 1024 * 1024,
            level_multiplier: 10,
            target_file_size: 2 * 1024 * 1024,
            max_grandparent_overlap_factor: 10,
            expanded_compaction_factor: 25,
            multilevel_compactions: false,
            max_concurrent_compactions: 1,
            disable_automatic_compactions: false,
            block_size: 4096,
            bloom_bits_per_key: 10,
            table_cache_capacity: 256,
            max_manifest_size: 4 * 1024 * 1024,
            paranoid_checks: false,
            value_separation: ValueSeparationOptions::default(),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("comparer", &self.comparer.name)
            .field("merger", &self.merger.name)
            .field("memtable_size", &self.memtable_size)
            .field("wal_sync", &self.wal_sync)
            .field("l0_compaction_threshold", &self.l0_compaction_threshold)
            .field("lbase_max_bytes", &self.lbase_max_bytes)
            .field("level_multiplier", &self.level_multiplier)
            .field("target_file_size", &self.target_file_size)
            .field("multilevel_compactions", &self.multilevel_compactions)
            .field("max_concurrent_compactions", &self.max_concurrent_compactions)
            .field(
                "disable_automatic_compactions",
                &self.disable_automatic_compactions,
            )
            .field("bloom_bits_per_key", &self.bloom_bits_per_key)
            .field("value_separation", &self.value_separation)
            .finish()
    }
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Env { var, value: raw }),
        Err(_) => Ok(default),
    }
}

impl Options {
    /// Defaults overlaid with `SHOAL_*` environment variables, validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] for unparsable variables and
    /// [`ConfigError::Invalid`] when the result fails [`Options::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut opts = Options::default();
        opts.memtable_size = parse_env("SHOAL_MEMTABLE_KB", opts.memtable_size / 1024)? * 1024;
        opts.wal_sync = parse_env("SHOAL_WAL_SYNC", opts.wal_sync)?;
        opts.l0_compaction_threshold = parse_env("SHOAL_L0_TRIGGER", opts.l0_compaction_threshold)?;
        opts.target_file_size =
            parse_env("SHOAL_TARGET_FILE_KB", opts.target_file_size / 1024)? * 1024;
        opts.disable_automatic_compactions = !parse_env("SHOAL_AUTO_COMPACTIONS", true)?;
        opts.max_concurrent_compactions =
            parse_env("SHOAL_COMPACTION_THREADS", opts.max_concurrent_compactions)?;
        opts.multilevel_compactions = parse_env("SHOAL_MULTILEVEL", opts.multilevel_compactions)?;
        opts.bloom_bits_per_key = parse_env("SHOAL_BLOOM_BITS", opts.bloom_bits_per_key)?;
        opts.value_separation.enabled =
            parse_env("SHOAL_VALUE_SEPARATION", opts.value_separation.enabled)?;
        opts.value_separation.minimum_size =
            parse_env("SHOAL_BLOB_MIN_SIZE", opts.value_separation.minimum_size)?;
        if env_or("SHOAL_COMPARER", "bytewise") == "versioned" {
            opts.comparer = &base::VERSIONED_COMPARER;
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Checks that the options describe a runnable engine.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }
        if self.memtable_size == 0 {
            return Err(invalid("memtable_size", "must be positive"));
        }
        if self.l0_compaction_threshold == 0 {
            return Err(invalid("l0_compaction_threshold", "must be positive"));
        }
        if self.level_multiplier < 2 {
            return Err(invalid("level_multiplier", "must be at least 2"));
        }
        if self.target_file_size == 0 || self.lbase_max_bytes == 0 {
            return Err(invalid("target_file_size", "sizes must be positive"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size", "must be positive"));
        }
        if self.max_concurrent_compactions == 0 {
            return Err(invalid("max_concurrent_compactions", "must be positive"));
        }
        if self.table_cache_capacity == 0 {
            return Err(invalid("table_cache_capacity", "must be positive"));
        }
        let vs = &self.value_separation;
        if vs.enabled && vs.blob_block_size == 0 {
            return Err(invalid("value_separation.blob_block_size", "must be positive"));
        }
        if vs.enabled && vs.max_blob_reference_depth == 0 {
            return Err(invalid(
                "value_separation.max_blob_reference_depth",
                "must be positive",
            ));
        }
        let bound = &vs.required_in_place;
        if !bound.is_empty() && self.comparer.cmp(&bound.lower, &bound.upper).is_ge() {
            return Err(invalid(
                "value_separation.required_in_place",
                "lower bound must sort before upper bound",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(Options::default().validate(), Ok(()));
    }

    #[test]
    fn zero_memtable_is_rejected() {
        let opts = Options {
            memtable_size: 0,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::Invalid {
                field: "memtable_size",
                ..
            })
        ));
    }

    #[test]
    fn inverted_in_place_bound_is_rejected() {
        let mut opts = Options::default();
        opts.value_separation.required_in_place = UserKeyPrefixBound {
            lower: b"z".to_vec(),
            upper: b"a".to_vec(),
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn debug_names_the_comparer() {
        let s = format!("{:?}", Options::default());
        assert!(s.contains("shoal.BytewiseComparator"));
    }
}
