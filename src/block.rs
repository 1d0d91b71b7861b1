//! Compressed layout: `buckets_per_block` buckets share one block of
//! `block_bits` bits.
//!
//! Bit layout of a block, from bit 0 upward:
//!
//! ```text
//! | counters: B x c bits | overflow: B x 1 bit | free ... | fp[n-1] ... fp[1] fp[0] |
//! 0                                                                        block_bits
//! ```
//!
//! `c = ceil(log2(A + 1))`. Fingerprints grow from the top of the block
//! downward: slot `s` occupies `[block_bits - (s + 1) * k, block_bits - s * k)`.
//! They are grouped by bucket in bucket order with no gaps, so bucket `i`'s run
//! starts at slot `sum(counters[..i])`. Bits below the packed run are zero.
//!
//! A set overflow bit means some key whose primary bucket is this one may live
//! at its alternate bucket. While it is clear, lookups only check the primary.

use rand::{rngs::StdRng, Rng};

use crate::{
    addresser::PartitionAddresser,
    batch::Location,
    bits::{bits_for, clear_bits, move_bits, read_bits, write_bits, Bits, WORD_BITS},
    config::{FilterConfig, Layout},
    error::{FilterError, Result},
    eviction::Buckets,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    associativity: usize,
    fingerprint_bits: usize,
    block_bits: usize,
    buckets_per_block: usize,
    counter_bits: usize,
    overflow_tracking: bool,
    /// Fingerprints one block can hold.
    capacity: usize,
}

impl BlockLayout {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        match config.layout {
            Layout::Block {
                block_bits,
                buckets_per_block,
                overflow_tracking,
            } => Self::new(
                config.associativity,
                config.fingerprint_bits,
                block_bits,
                buckets_per_block,
                overflow_tracking,
            ),
            Layout::Standard => Err(FilterError::invalid_configuration(
                "not a block layout",
            )),
        }
    }

    pub fn new(
        associativity: usize,
        fingerprint_bits: u32,
        block_bits: usize,
        buckets_per_block: Option<usize>,
        overflow_tracking: bool,
    ) -> Result<Self> {
        let k = fingerprint_bits as usize;
        if block_bits == 0 || block_bits % WORD_BITS != 0 {
            return Err(FilterError::invalid_configuration(format!(
                "block size {} is not a multiple of {} bits",
                block_bits, WORD_BITS
            )));
        }
        if associativity == 0 || associativity > u8::MAX as usize || k == 0 || k > 32 {
            return Err(FilterError::invalid_configuration(format!(
                "associativity {} with {}-bit fingerprints cannot be packed into blocks",
                associativity, k
            )));
        }
        let buckets_per_block =
            buckets_per_block.unwrap_or_else(|| (block_bits / (associativity * k)).max(1));
        let counter_bits = bits_for(associativity);
        let header_bits = buckets_per_block * (counter_bits + overflow_tracking as usize);
        if buckets_per_block == 0 || header_bits >= block_bits {
            return Err(FilterError::invalid_configuration(format!(
                "{} buckets leave no room for fingerprints in a {}-bit block",
                buckets_per_block, block_bits
            )));
        }
        let capacity = (block_bits - header_bits) / k;
        if capacity < associativity {
            return Err(FilterError::invalid_configuration(format!(
                "a {}-bit block holds {} fingerprints of {} bits, less than one bucket of {}",
                block_bits, capacity, k, associativity
            )));
        }
        Ok(BlockLayout {
            associativity,
            fingerprint_bits: k,
            block_bits,
            buckets_per_block,
            counter_bits,
            overflow_tracking,
            capacity,
        })
    }

    pub fn buckets_per_block(&self) -> usize {
        self.buckets_per_block
    }

    pub fn block_capacity(&self) -> usize {
        self.capacity
    }

    pub fn counter_bits(&self) -> usize {
        self.counter_bits
    }

    pub fn overflow_tracking(&self) -> bool {
        self.overflow_tracking
    }

    /// Buckets needed for `slots` fingerprints, a whole number of blocks.
    pub fn buckets_for(&self, slots: usize) -> usize {
        slots.div_ceil(self.capacity).max(1) * self.buckets_per_block
    }

    pub fn blocks_for(&self, buckets: usize) -> usize {
        buckets.div_ceil(self.buckets_per_block)
    }

    pub fn storage_bits(&self, buckets: usize) -> usize {
        self.blocks_for(buckets) * self.block_bits
    }

    #[inline]
    fn split(&self, bucket: usize) -> (usize, usize) {
        (
            bucket / self.buckets_per_block * self.block_bits,
            bucket % self.buckets_per_block,
        )
    }

    #[inline]
    fn counter(&self, bits: &Bits, base: usize, index: usize) -> usize {
        read_bits(bits, base + index * self.counter_bits, self.counter_bits) as usize
    }

    #[inline]
    fn set_counter(&self, bits: &mut Bits, base: usize, index: usize, value: usize) {
        write_bits(
            bits,
            base + index * self.counter_bits,
            self.counter_bits,
            value as u64,
        );
    }

    #[inline]
    fn overflow_offset(&self, base: usize, index: usize) -> usize {
        base + self.buckets_per_block * self.counter_bits + index
    }

    /// Whether lookups for keys whose primary is `bucket` must also check the
    /// alternate bucket.
    #[inline]
    pub fn overflowed(&self, bits: &Bits, bucket: usize) -> bool {
        if !self.overflow_tracking {
            return true;
        }
        let (base, index) = self.split(bucket);
        bits[self.overflow_offset(base, index)]
    }

    /// Number of fingerprints stored in the buckets before `index` in the block at `base`.
    #[inline]
    pub fn bucket_slot_offset(&self, bits: &Bits, base: usize, index: usize) -> usize {
        (0..index).map(|i| self.counter(bits, base, i)).sum()
    }

    #[inline]
    fn occupied(&self, bits: &Bits, base: usize) -> usize {
        self.bucket_slot_offset(bits, base, self.buckets_per_block)
    }

    #[inline]
    fn slot_offset(&self, base: usize, slot: usize) -> usize {
        base + self.block_bits - (slot + 1) * self.fingerprint_bits
    }

    #[inline]
    fn read_slot(&self, bits: &Bits, base: usize, slot: usize) -> u64 {
        read_bits(bits, self.slot_offset(base, slot), self.fingerprint_bits)
    }

    #[inline]
    fn write_slot(&self, bits: &mut Bits, base: usize, slot: usize, fp: u64) {
        write_bits(bits, self.slot_offset(base, slot), self.fingerprint_bits, fp);
    }

    /// Inserts `fp` at slot `slot`, moving slots `slot..occupied` one down.
    fn open_slot(&self, bits: &mut Bits, base: usize, slot: usize, occupied: usize, fp: u64) {
        let k = self.fingerprint_bits;
        let top = base + self.block_bits;
        move_bits(bits, top - occupied * k..top - slot * k, top - (occupied + 1) * k);
        self.write_slot(bits, base, slot, fp);
    }

    /// Removes slot `slot`, closing the gap and zeroing the freed bits.
    fn close_slot(&self, bits: &mut Bits, base: usize, slot: usize, occupied: usize) -> u64 {
        let k = self.fingerprint_bits;
        let top = base + self.block_bits;
        let fp = self.read_slot(bits, base, slot);
        move_bits(bits, top - occupied * k..top - (slot + 1) * k, top - (occupied - 1) * k);
        clear_bits(bits, top - occupied * k..top - (occupied - 1) * k);
        fp
    }

    pub fn bucket_contains(&self, bits: &Bits, bucket: usize, fp: u64) -> bool {
        let (base, index) = self.split(bucket);
        let start = self.bucket_slot_offset(bits, base, index);
        let count = self.counter(bits, base, index);
        (start..start + count).any(|slot| self.read_slot(bits, base, slot) == fp)
    }

    pub fn contains(
        &self,
        bits: &Bits,
        addresser: &PartitionAddresser,
        location: Location,
    ) -> bool {
        let Location {
            primary,
            fingerprint,
        } = location;
        if self.bucket_contains(bits, primary, fingerprint) {
            return true;
        }
        self.overflowed(bits, primary)
            && self.bucket_contains(bits, addresser.alternate(primary, fingerprint), fingerprint)
    }

    /// Fingerprints stored in the blocks covering the first `buckets` buckets.
    pub fn occupancy(&self, bits: &Bits, buckets: usize) -> usize {
        (0..self.blocks_for(buckets))
            .map(|block| self.occupied(bits, block * self.block_bits))
            .sum()
    }

    /// Checks the counter and packing invariants of every block.
    pub fn check_invariants(&self, bits: &Bits, buckets: usize) -> std::result::Result<(), String> {
        let header = self.buckets_per_block * (self.counter_bits + self.overflow_tracking as usize);
        for block in 0..self.blocks_for(buckets) {
            let base = block * self.block_bits;
            for i in 0..self.buckets_per_block {
                let count = self.counter(bits, base, i);
                if count > self.associativity {
                    return Err(format!("block {} bucket {} holds {}", block, i, count));
                }
            }
            let occupied = self.occupied(bits, base);
            if occupied > self.capacity {
                return Err(format!(
                    "block {} holds {} of {} fingerprints",
                    block, occupied, self.capacity
                ));
            }
            let packed_end = base + self.block_bits - occupied * self.fingerprint_bits;
            if bits[base + header..packed_end].any() {
                return Err(format!(
                    "block {} has bits set outside its {} packed fingerprints",
                    block, occupied
                ));
            }
        }
        Ok(())
    }

    pub fn table<'a>(&self, bits: &'a mut Bits) -> BlockTable<'a> {
        BlockTable {
            layout: *self,
            bits,
        }
    }
}

/// Mutable view over one partition's blocks.
pub struct BlockTable<'a> {
    layout: BlockLayout,
    bits: &'a mut Bits,
}

impl BlockTable<'_> {
    /// First non-empty bucket after `index`, else the last one before it.
    fn neighbour_victim(&self, base: usize, index: usize) -> Option<usize> {
        let l = &self.layout;
        (index + 1..l.buckets_per_block)
            .chain((0..index).rev())
            .find(|&i| l.counter(self.bits, base, i) > 0)
    }
}

impl Buckets for BlockTable<'_> {
    fn try_insert(&mut self, bucket: usize, fp: u64) -> bool {
        let l = self.layout;
        let (base, index) = l.split(bucket);
        let count = l.counter(self.bits, base, index);
        if count >= l.associativity {
            return false;
        }
        let occupied = l.occupied(self.bits, base);
        if occupied >= l.capacity {
            return false;
        }
        let slot = l.bucket_slot_offset(self.bits, base, index) + count;
        l.open_slot(self.bits, base, slot, occupied, fp);
        l.set_counter(self.bits, base, index, count + 1);
        true
    }

    fn kick(&mut self, bucket: usize, fp: u64, rng: &mut StdRng) -> (usize, u64) {
        let l = self.layout;
        let (base, index) = l.split(bucket);
        let count = l.counter(self.bits, base, index);
        let start = l.bucket_slot_offset(self.bits, base, index);

        if count >= l.associativity {
            let slot = start + rng.random_range(0..count);
            let victim = l.read_slot(self.bits, base, slot);
            l.write_slot(self.bits, base, slot, fp);
            return (bucket, victim);
        }

        // The bucket has room but the block is full: evict from a neighbour.
        let Some(neighbour) = self.neighbour_victim(base, index) else {
            return (bucket, fp);
        };
        let occupied = l.occupied(self.bits, base);
        let n_count = l.counter(self.bits, base, neighbour);
        let n_start = l.bucket_slot_offset(self.bits, base, neighbour);
        let victim = l.close_slot(
            self.bits,
            base,
            n_start + rng.random_range(0..n_count),
            occupied,
        );
        l.set_counter(self.bits, base, neighbour, n_count - 1);

        // The neighbour's run may have been before ours.
        let start = if neighbour < index { start - 1 } else { start };
        l.open_slot(self.bits, base, start + count, occupied - 1, fp);
        l.set_counter(self.bits, base, index, count + 1);

        let first_bucket = bucket - index;
        (first_bucket + neighbour, victim)
    }

    fn note_overflow(&mut self, bucket: usize) {
        if self.layout.overflow_tracking {
            let (base, index) = self.layout.split(bucket);
            let offset = self.layout.overflow_offset(base, index);
            self.bits.set(offset, true);
        }
    }
}
