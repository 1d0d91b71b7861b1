//! Maps hashes to bucket addresses inside a partition and computes the
//! alternate bucket of a fingerprint.
//!
//! `alternate` is an involution for every mode and capacity: applying it twice
//! with the same fingerprint returns the starting address. Eviction chains
//! depend on this to find their way back.

use crate::{
    bits::mask,
    error::{FilterError, Result},
    hasher::fmix64,
};

/// Largest per-partition bucket count; Lemire reduction works on 32-bit hashes.
pub const MAX_BUCKETS: usize = 1 << 32;

const FINGERPRINT_SALT: u64 = 0x2545_f491_4f6c_dd1d;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingMode {
    /// Capacity rounded up to a power of two, xor-based alternate. The
    /// rounding leaves headroom that keeps low associativities off the
    /// fallback path.
    #[default]
    Pow2,
    /// Any capacity, multiply-high reduction.
    Lemire,
    /// Any capacity, `hash % capacity`.
    Modulo,
}

/// Addressing for a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAddresser {
    mode: AddressingMode,
    capacity: usize,
}

impl PartitionAddresser {
    /// Builds an addresser with at least `requested` buckets.
    pub fn new(mode: AddressingMode, requested: usize, partition: usize) -> Result<Self> {
        let capacity = match mode {
            AddressingMode::Pow2 => requested.max(1).checked_next_power_of_two(),
            AddressingMode::Lemire | AddressingMode::Modulo => Some(requested.max(1)),
        };
        match capacity {
            Some(capacity) if capacity <= MAX_BUCKETS => Ok(PartitionAddresser { mode, capacity }),
            _ => Err(FilterError::CapacityExhausted {
                partition,
                requested,
            }),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn primary(&self, hash: u64) -> usize {
        match self.mode {
            AddressingMode::Pow2 => (hash as usize) & (self.capacity - 1),
            AddressingMode::Lemire => ((hash as u32 as u64 * self.capacity as u64) >> 32) as usize,
            AddressingMode::Modulo => (hash % self.capacity as u64) as usize,
        }
    }

    #[inline]
    pub fn alternate(&self, address: usize, fingerprint: u64) -> usize {
        let offset = fmix64(fingerprint ^ FINGERPRINT_SALT);
        match self.mode {
            AddressingMode::Pow2 => (address ^ offset as usize) & (self.capacity - 1),
            AddressingMode::Lemire | AddressingMode::Modulo => {
                let pivot = (offset % self.capacity as u64) as usize;
                if pivot >= address {
                    pivot - address
                } else {
                    pivot + self.capacity - address
                }
            }
        }
    }
}

/// Per-partition addressing for a whole filter.
#[derive(Debug, Clone, Default)]
pub struct Addresser {
    partitions: Vec<PartitionAddresser>,
}

impl Addresser {
    pub fn new(mode: AddressingMode, requested: &[usize]) -> Result<Self> {
        let partitions = requested
            .iter()
            .enumerate()
            .map(|(i, &r)| PartitionAddresser::new(mode, r, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Addresser { partitions })
    }

    pub fn partition(&self, partition: usize) -> PartitionAddresser {
        self.partitions[partition]
    }

    pub fn size(&self, partition: usize) -> usize {
        self.partitions[partition].size()
    }

    pub fn primary(&self, partition: usize, hash: u64) -> usize {
        self.partitions[partition].primary(hash)
    }

    pub fn alternate(&self, partition: usize, address: usize, fingerprint: u64) -> usize {
        self.partitions[partition].alternate(address, fingerprint)
    }
}

/// Top `bits` bits of `hash`. With `nonzero`, zero maps to 1 so it can serve
/// as the empty-slot marker.
#[inline]
pub fn fingerprint(hash: u64, bits: u32, nonzero: bool) -> u64 {
    let fp = (hash >> (64 - bits)) & mask(bits);
    if nonzero && fp == 0 {
        1
    } else {
        fp
    }
}
