//! Standard layout: bucket `b` is `associativity` slots of `k` bits stored at
//! bit `b * associativity * k`. A zero slot is empty, so fingerprints are never
//! zero.

use rand::{rngs::StdRng, Rng};

use crate::{
    addresser::PartitionAddresser,
    batch::Location,
    bits::{mask, read_bits, write_bits, Bits, WORD_BITS},
    error::{FilterError, Result},
    eviction::Buckets,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardLayout {
    associativity: usize,
    fingerprint_bits: u32,
    /// Each field's low bit set, for whole-bucket comparisons.
    lows: u64,
    /// Each field's high bit set.
    highs: u64,
}

impl StandardLayout {
    /// A bucket has to fit one register so all its slots compare at once.
    pub fn new(associativity: usize, fingerprint_bits: u32) -> Result<Self> {
        let bucket_bits = associativity * fingerprint_bits as usize;
        if associativity == 0 || fingerprint_bits == 0 || bucket_bits > WORD_BITS {
            return Err(FilterError::invalid_configuration(format!(
                "a bucket of {} x {} bits does not fit a {}-bit register",
                associativity, fingerprint_bits, WORD_BITS
            )));
        }
        let lows = (0..associativity)
            .fold(0u64, |acc, i| acc | 1u64 << (i as u32 * fingerprint_bits));
        Ok(StandardLayout {
            associativity,
            fingerprint_bits,
            lows,
            highs: lows << (fingerprint_bits - 1),
        })
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn bucket_bits(&self) -> usize {
        self.associativity * self.fingerprint_bits as usize
    }

    /// Buckets needed for `slots` fingerprints.
    pub fn buckets_for(&self, slots: usize) -> usize {
        slots.div_ceil(self.associativity)
    }

    pub fn storage_bits(&self, buckets: usize) -> usize {
        buckets * self.bucket_bits()
    }

    #[inline]
    fn read_bucket(&self, bits: &Bits, bucket: usize) -> u64 {
        read_bits(bits, bucket * self.bucket_bits(), self.bucket_bits())
    }

    /// Mask with a bit set inside every field of `word` equal to `fp`. Only
    /// the lowest flagged field is exact; callers only test for zero or take
    /// the lowest bit.
    #[inline]
    fn matching_fields(&self, word: u64, fp: u64) -> u64 {
        let k = self.fingerprint_bits;
        if k == 1 {
            let fill = if fp == 0 { 0 } else { self.lows };
            return !(word ^ fill) & self.lows;
        }
        let x = word ^ fp.wrapping_mul(self.lows);
        x.wrapping_sub(self.lows) & !x & self.highs
    }

    #[inline]
    pub fn bucket_contains(&self, bits: &Bits, bucket: usize, fp: u64) -> bool {
        self.matching_fields(self.read_bucket(bits, bucket), fp) != 0
    }

    #[inline]
    fn free_slot(&self, bits: &Bits, bucket: usize) -> Option<usize> {
        match self.matching_fields(self.read_bucket(bits, bucket), 0) {
            0 => None,
            m => Some(m.trailing_zeros() as usize / self.fingerprint_bits as usize),
        }
    }

    #[inline]
    fn slot_offset(&self, bucket: usize, slot: usize) -> usize {
        bucket * self.bucket_bits() + slot * self.fingerprint_bits as usize
    }

    pub fn contains(
        &self,
        bits: &Bits,
        addresser: &PartitionAddresser,
        location: Location,
    ) -> bool {
        self.bucket_contains(bits, location.primary, location.fingerprint)
            || self.bucket_contains(
                bits,
                addresser.alternate(location.primary, location.fingerprint),
                location.fingerprint,
            )
    }

    /// Number of occupied slots among the first `buckets` buckets.
    pub fn occupancy(&self, bits: &Bits, buckets: usize) -> usize {
        let k = self.fingerprint_bits;
        (0..buckets)
            .map(|b| {
                let word = self.read_bucket(bits, b);
                (0..self.associativity)
                    .filter(|&i| (word >> (i as u32 * k)) & mask(k) != 0)
                    .count()
            })
            .sum()
    }

    pub fn table<'a>(&self, bits: &'a mut Bits) -> StandardTable<'a> {
        StandardTable {
            layout: *self,
            bits,
        }
    }
}

/// Mutable view over one partition's buckets.
pub struct StandardTable<'a> {
    layout: StandardLayout,
    bits: &'a mut Bits,
}

impl Buckets for StandardTable<'_> {
    fn try_insert(&mut self, bucket: usize, fp: u64) -> bool {
        match self.layout.free_slot(self.bits, bucket) {
            Some(slot) => {
                let offset = self.layout.slot_offset(bucket, slot);
                write_bits(self.bits, offset, self.layout.fingerprint_bits as usize, fp);
                true
            }
            None => false,
        }
    }

    fn kick(&mut self, bucket: usize, fp: u64, rng: &mut StdRng) -> (usize, u64) {
        let slot = rng.random_range(0..self.layout.associativity);
        let offset = self.layout.slot_offset(bucket, slot);
        let width = self.layout.fingerprint_bits as usize;
        let victim = read_bits(self.bits, offset, width);
        write_bits(self.bits, offset, width, fp);
        (bucket, victim)
    }
}
