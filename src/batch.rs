//! Key processing in groups of lanes.
//!
//! `BatchOps` locates a run of keys (hash, primary address, fingerprint). The
//! scalar implementation handles one key at a time; `LaneOps<G>` runs each
//! step over `G` lanes in straight-line loops the compiler can vectorize, with
//! an active mask covering the ragged tail. Both give identical results.

use crate::{
    addresser::{fingerprint, PartitionAddresser},
    hasher::Hasher,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchWidth {
    #[default]
    Scalar,
    X4,
    X8,
    X16,
}

impl BatchWidth {
    pub fn lanes(self) -> usize {
        match self {
            BatchWidth::Scalar => 1,
            BatchWidth::X4 => 4,
            BatchWidth::X8 => 8,
            BatchWidth::X16 => 16,
        }
    }
}

/// Where a key lives inside one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub primary: usize,
    pub fingerprint: u64,
}

/// Everything needed to locate keys inside one partition.
#[derive(Debug, Clone, Copy)]
pub struct KeyLocator {
    pub hasher: Hasher,
    pub addresser: PartitionAddresser,
    pub fingerprint_bits: u32,
    pub nonzero_fingerprints: bool,
}

impl KeyLocator {
    #[inline]
    pub fn locate(&self, key: u64) -> Location {
        let hash = self.hasher.hash(key);
        let fp_hash = self.hasher.rehash(hash, key);
        Location {
            primary: self.addresser.primary(hash),
            fingerprint: fingerprint(fp_hash, self.fingerprint_bits, self.nonzero_fingerprints),
        }
    }

    /// Locates every key, `width` lanes at a time.
    pub fn locate_all(&self, width: BatchWidth, keys: &[u64], out: &mut Vec<Location>) {
        out.clear();
        out.reserve(keys.len());
        match width {
            BatchWidth::Scalar => ScalarOps::locate(self, keys, out),
            BatchWidth::X4 => LaneOps::<4>::locate(self, keys, out),
            BatchWidth::X8 => LaneOps::<8>::locate(self, keys, out),
            BatchWidth::X16 => LaneOps::<16>::locate(self, keys, out),
        }
    }
}

pub trait BatchOps {
    /// Appends the location of every key in `keys` to `out`, in order.
    fn locate(locator: &KeyLocator, keys: &[u64], out: &mut Vec<Location>);
}

pub struct ScalarOps;

impl BatchOps for ScalarOps {
    fn locate(locator: &KeyLocator, keys: &[u64], out: &mut Vec<Location>) {
        out.extend(keys.iter().map(|&key| locator.locate(key)));
    }
}

pub struct LaneOps<const G: usize>;

impl<const G: usize> BatchOps for LaneOps<G> {
    fn locate(locator: &KeyLocator, keys: &[u64], out: &mut Vec<Location>) {
        for chunk in keys.chunks(G) {
            let keys = Lanes::<G>::load(chunk);
            let hashes = keys.map(|k| locator.hasher.hash(k));
            let fp_hashes = hashes.zip_map(&keys, |h, k| locator.hasher.rehash(h, k));
            let primaries = hashes.map(|h| locator.addresser.primary(h) as u64);
            let fps = fp_hashes.map(|h| {
                fingerprint(h, locator.fingerprint_bits, locator.nonzero_fingerprints)
            });
            out.extend(keys.active_lanes().map(|lane| Location {
                primary: primaries.get(lane) as usize,
                fingerprint: fps.get(lane),
            }));
        }
    }
}

/// `G` values with a mask of the lanes that carry real input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lanes<const G: usize> {
    values: [u64; G],
    active: u64,
}

impl<const G: usize> Lanes<G> {
    /// Loads up to `G` values; lanes past `src.len()` are inactive and zero.
    pub fn load(src: &[u64]) -> Self {
        debug_assert!(G <= 64);
        let n = src.len().min(G);
        let mut values = [0u64; G];
        values[..n].copy_from_slice(&src[..n]);
        let active = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
        Lanes { values, active }
    }

    /// Applies `f` to every lane, active or not.
    #[inline]
    pub fn map(&self, f: impl Fn(u64) -> u64) -> Self {
        let mut values = [0u64; G];
        for (out, &v) in values.iter_mut().zip(self.values.iter()) {
            *out = f(v);
        }
        Lanes {
            values,
            active: self.active,
        }
    }

    #[inline]
    pub fn zip_map(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        let mut values = [0u64; G];
        for lane in 0..G {
            values[lane] = f(self.values[lane], other.values[lane]);
        }
        Lanes {
            values,
            active: self.active & other.active,
        }
    }

    #[inline]
    pub fn get(&self, lane: usize) -> u64 {
        self.values[lane]
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = usize> {
        let active = self.active;
        (0..G).filter(move |&lane| (active >> lane) & 1 == 1)
    }
}
