//! Splits keys into disjoint partitions before construction.

use log::debug;

use crate::hasher::fmix64;

const PARTITION_SEED: u64 = 0x51af_d7ed_558c_cd1f;

/// Partition of `key` among `n_partitions`. Fixed for the lifetime of a filter;
/// reseeding a partition never moves keys between partitions.
#[inline]
pub fn partition_of(key: u64, n_partitions: usize) -> usize {
    if n_partitions <= 1 {
        return 0;
    }
    ((fmix64(key ^ PARTITION_SEED) as u128 * n_partitions as u128) >> 64) as usize
}

/// Keys grouped by partition: partition `p` owns `values[offsets[p]..offsets[p + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSet {
    pub histogram: Vec<usize>,
    pub offsets: Vec<usize>,
    pub values: Vec<u64>,
    pub n_partitions: usize,
}

impl PartitionSet {
    pub fn build(keys: &[u64], n_partitions: usize) -> Self {
        let n_partitions = n_partitions.max(1);
        let mut histogram = vec![0usize; n_partitions];
        for &key in keys {
            histogram[partition_of(key, n_partitions)] += 1;
        }

        let mut offsets = Vec::with_capacity(n_partitions + 1);
        let mut total = 0;
        offsets.push(total);
        for count in &histogram {
            total += count;
            offsets.push(total);
        }

        let mut cursor = offsets[..n_partitions].to_vec();
        let mut values = vec![0u64; keys.len()];
        for &key in keys {
            let p = partition_of(key, n_partitions);
            values[cursor[p]] = key;
            cursor[p] += 1;
        }

        debug!(
            "partitioned {} keys into {} partitions, largest = {}",
            keys.len(),
            n_partitions,
            histogram.iter().max().copied().unwrap_or(0)
        );
        PartitionSet {
            histogram,
            offsets,
            values,
            n_partitions,
        }
    }

    pub fn keys(&self, partition: usize) -> &[u64] {
        &self.values[self.offsets[partition]..self.offsets[partition + 1]]
    }
}
