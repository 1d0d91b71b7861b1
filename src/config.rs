//! Filter configuration, chosen once when a filter is created.

use crate::{
    addresser::AddressingMode,
    batch::BatchWidth,
    block::BlockLayout,
    error::{FilterError, Result},
    hasher::HashMode,
    standard::StandardLayout,
};

pub const DEFAULT_BLOCK_BITS: usize = 512;
pub const DEFAULT_MAX_KICKS: usize = 500;
pub const DEFAULT_MAX_RETRIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One independent bucket of `associativity` slots per address.
    Standard,
    /// Buckets share cache-line sized blocks with per-bucket counters.
    Block {
        block_bits: usize,
        /// Derived from the block size when `None`.
        buckets_per_block: Option<usize>,
        overflow_tracking: bool,
    },
}

impl Layout {
    pub fn block() -> Self {
        Layout::Block {
            block_bits: DEFAULT_BLOCK_BITS,
            buckets_per_block: None,
            overflow_tracking: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub associativity: usize,
    pub fingerprint_bits: u32,
    pub layout: Layout,
    pub addressing: AddressingMode,
    pub hashing: HashMode,
    /// Slot capacity as a percentage of the number of keys.
    pub load_factor: u32,
    /// 1 disables partitioning.
    pub partitions: usize,
    pub threads: usize,
    pub batch: BatchWidth,
    pub max_kicks: usize,
    pub max_retries: usize,
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            associativity: 4,
            fingerprint_bits: 8,
            layout: Layout::Standard,
            addressing: AddressingMode::Pow2,
            hashing: HashMode::Murmur3,
            load_factor: 115,
            partitions: 1,
            threads: 1,
            batch: BatchWidth::Scalar,
            max_kicks: DEFAULT_MAX_KICKS,
            max_retries: DEFAULT_MAX_RETRIES,
            seed: 0x5eed,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.associativity == 0 {
            return Err(FilterError::invalid_configuration(
                "associativity must be at least 1",
            ));
        }
        if self.fingerprint_bits == 0 || self.fingerprint_bits > 32 {
            return Err(FilterError::invalid_configuration(format!(
                "fingerprint width {} is outside 1..=32",
                self.fingerprint_bits
            )));
        }
        if self.load_factor < 100 {
            return Err(FilterError::invalid_configuration(format!(
                "load factor {}% leaves fewer slots than keys",
                self.load_factor
            )));
        }
        if self.partitions == 0 || self.threads == 0 || self.max_retries == 0 {
            return Err(FilterError::invalid_configuration(
                "partitions, threads and max_retries must be at least 1",
            ));
        }
        match self.layout {
            Layout::Standard => {
                StandardLayout::new(self.associativity, self.fingerprint_bits)?;
            }
            Layout::Block { .. } => {
                BlockLayout::from_config(self)?;
            }
        }
        Ok(())
    }

    /// Number of fingerprint slots to reserve for `keys` keys.
    pub fn slots_for(&self, keys: usize) -> usize {
        (keys as u128 * self.load_factor as u128).div_ceil(100) as usize
    }
}
