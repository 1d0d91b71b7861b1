//! Runtime choice between the two layouts.

use rand::rngs::StdRng;

use crate::{
    addresser::PartitionAddresser,
    batch::{BatchWidth, KeyLocator, Location},
    bits::Bits,
    block::BlockLayout,
    config::{FilterConfig, Layout},
    error::Result,
    eviction::Evictor,
    standard::StandardLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Standard(StandardLayout),
    Block(BlockLayout),
}

impl Container {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        Ok(match config.layout {
            Layout::Standard => Container::Standard(StandardLayout::new(
                config.associativity,
                config.fingerprint_bits,
            )?),
            Layout::Block { .. } => Container::Block(BlockLayout::from_config(config)?),
        })
    }

    /// The standard layout reserves zero for empty slots.
    pub fn nonzero_fingerprints(&self) -> bool {
        matches!(self, Container::Standard(_))
    }

    pub fn buckets_for(&self, slots: usize) -> usize {
        match self {
            Container::Standard(l) => l.buckets_for(slots),
            Container::Block(l) => l.buckets_for(slots),
        }
    }

    pub fn storage_bits(&self, buckets: usize) -> usize {
        match self {
            Container::Standard(l) => l.storage_bits(buckets),
            Container::Block(l) => l.storage_bits(buckets),
        }
    }

    pub fn slot_capacity(&self, buckets: usize) -> usize {
        match self {
            Container::Standard(l) => buckets * l.associativity(),
            Container::Block(l) => l.blocks_for(buckets) * l.block_capacity(),
        }
    }

    #[inline]
    pub fn contains(
        &self,
        bits: &Bits,
        addresser: &PartitionAddresser,
        location: Location,
    ) -> bool {
        match self {
            Container::Standard(l) => l.contains(bits, addresser, location),
            Container::Block(l) => l.contains(bits, addresser, location),
        }
    }

    pub fn occupancy(&self, bits: &Bits, buckets: usize) -> usize {
        match self {
            Container::Standard(l) => l.occupancy(bits, buckets),
            Container::Block(l) => l.occupancy(bits, buckets),
        }
    }

    /// Inserts one key's fingerprint. On failure returns the fingerprint left
    /// without a slot and the bucket it was headed for.
    pub fn insert(
        &self,
        bits: &mut Bits,
        addresser: PartitionAddresser,
        location: Location,
        max_kicks: usize,
        rng: &mut StdRng,
    ) -> Option<(usize, u64)> {
        match self {
            Container::Standard(l) => Evictor {
                table: l.table(bits),
                addresser,
                max_kicks,
                rng,
            }
            .insert_or_displace(location),
            Container::Block(l) => Evictor {
                table: l.table(bits),
                addresser,
                max_kicks,
                rng,
            }
            .insert_or_displace(location),
        }
    }

    /// Inserts `keys` in order; false at the first key that does not fit.
    pub fn construct(
        &self,
        bits: &mut Bits,
        locator: &KeyLocator,
        width: BatchWidth,
        keys: &[u64],
        max_kicks: usize,
        rng: &mut StdRng,
    ) -> bool {
        let addresser = locator.addresser;
        match self {
            Container::Standard(l) => Evictor {
                table: l.table(bits),
                addresser,
                max_kicks,
                rng,
            }
            .insert_all(locator, width, keys),
            Container::Block(l) => Evictor {
                table: l.table(bits),
                addresser,
                max_kicks,
                rng,
            }
            .insert_all(locator, width, keys),
        }
    }
}
