use std::num::NonZeroUsize;

use crate::{Error, Result};

/// Default number of entries per bucket.
pub const DEFAULT_BUCKET_CAPACITY: usize = 5;
/// The directory never shrinks below this many home buckets.
pub const MIN_BUCKET_COUNT: usize = 32;
/// Grow while the load factor is above this.
pub const DEFAULT_MAX_LOAD_FACTOR: f64 = 0.95;
/// Shrink while the load factor is below this.
pub const DEFAULT_MIN_LOAD_FACTOR: f64 = 0.75;
/// Value overwrites tolerated before the data log is compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: u32 = 100;
/// Data log blobs kept in the read cache.
pub const DEFAULT_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
/// Table Configurations
pub struct Config {
    /// Entry slots per bucket.
    ///
    /// Only applies to new tables, an existing table keeps the capacity it was created with.
    ///
    /// Defaults to [DEFAULT_BUCKET_CAPACITY]
    pub bucket_capacity: usize,
    /// Initial bucket count, and the floor shrinking stops at. Must be a power of two.
    ///
    /// Defaults to [MIN_BUCKET_COUNT]
    pub min_bucket_count: usize,
    /// Load factor above which the table grows by one bucket at a time.
    ///
    /// Defaults to [DEFAULT_MAX_LOAD_FACTOR]
    pub max_load_factor: f64,
    /// Load factor below which the table shrinks by one bucket at a time.
    ///
    /// Defaults to [DEFAULT_MIN_LOAD_FACTOR]
    pub min_load_factor: f64,
    /// Number of in-place value overwrites after which the data log is
    /// rewritten without the superseded blobs.
    ///
    /// Defaults to [DEFAULT_COMPACTION_THRESHOLD]
    pub compaction_threshold: u32,
    /// Number of data log blobs cached in memory.
    ///
    /// Defaults to [DEFAULT_CACHE_SIZE]
    pub cache_size: NonZeroUsize,
    /// Check the bucket graph after every structural change.
    ///
    /// Defaults to `true`
    pub verify_structure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            min_bucket_count: MIN_BUCKET_COUNT,
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
            min_load_factor: DEFAULT_MIN_LOAD_FACTOR,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            cache_size: NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            verify_structure: true,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 || self.bucket_capacity > i32::MAX as usize {
            return Err(Error::InvalidConfig("bucket_capacity must be positive"));
        }
        if !self.min_bucket_count.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "min_bucket_count must be a power of two",
            ));
        }
        if !(self.min_load_factor > 0.0 && self.min_load_factor < self.max_load_factor) {
            return Err(Error::InvalidConfig(
                "load factors must satisfy 0 < min_load_factor < max_load_factor",
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(Error::InvalidConfig("compaction_threshold must be positive"));
        }

        Ok(())
    }
}
