//! Key hashing. All modes are deterministic for a given seed; the retry path
//! picks a fresh seed per rebuild attempt.

use murmurhash3::murmurhash3_x64_128 as mmh3;

const MUL: u64 = 0x9e37_79b9_7f4a_7c15;
const REHASH_MUL: u64 = 0xc2b2_ae3d_27d4_eb4f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    #[default]
    Murmur3,
    /// Single multiply with a fold of the high half; fastest, weakest.
    Multiplicative,
    /// Murmur3 64-bit finalizer applied to the seeded key.
    Fmix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hasher {
    mode: HashMode,
    seed: u64,
}

impl Hasher {
    pub fn new(mode: HashMode, seed: u64) -> Self {
        Hasher { mode, seed }
    }

    pub fn reseeded(&self, seed: u64) -> Self {
        Hasher { seed, ..*self }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn hash(&self, key: u64) -> u64 {
        match self.mode {
            HashMode::Murmur3 => mmh3(&key.to_le_bytes(), self.seed).0,
            HashMode::Multiplicative => {
                let h = (key ^ self.seed).wrapping_mul(MUL);
                h ^ (h >> 32)
            }
            HashMode::Fmix => fmix64(key ^ self.seed),
        }
    }

    /// A further hash draw for `key`, independent of `prev`'s bit positions.
    #[inline]
    pub fn rehash(&self, prev: u64, key: u64) -> u64 {
        match self.mode {
            HashMode::Murmur3 => mmh3(&key.to_le_bytes(), prev).1,
            HashMode::Multiplicative => {
                let h = (prev ^ key.rotate_left(32)).wrapping_mul(REHASH_MUL);
                h ^ (h >> 29)
            }
            HashMode::Fmix => fmix64(prev ^ key.rotate_left(32) ^ REHASH_MUL),
        }
    }
}

#[inline]
pub fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod test {
    use super::*;

    const MODES: [HashMode; 3] = [HashMode::Murmur3, HashMode::Multiplicative, HashMode::Fmix];

    #[test]
    fn deterministic_per_seed() {
        for mode in MODES {
            let a = Hasher::new(mode, 7);
            let b = Hasher::new(mode, 7);
            assert_eq!(a.hash(42), b.hash(42));
            assert_eq!(a.rehash(a.hash(42), 42), b.rehash(b.hash(42), 42));
        }
    }

    #[test]
    fn reseeding_changes_hash() {
        for mode in MODES {
            let a = Hasher::new(mode, 1);
            let b = a.reseeded(2);
            assert_eq!(b.seed(), 2);
            let differing = (0..64u64).filter(|&k| a.hash(k) != b.hash(k)).count();
            assert!(differing > 60, "{:?}: {}", mode, differing);
        }
    }

    #[test]
    fn low_bits_are_spread() {
        // Pow2 addressing masks the low bits, so consecutive keys must not collide there.
        for mode in MODES {
            let h = Hasher::new(mode, 0);
            let mut seen = [false; 256];
            for k in 0..256u64 {
                seen[(h.hash(k) & 0xff) as usize] = true;
            }
            let distinct = seen.iter().filter(|&&s| s).count();
            assert!(distinct > 128, "{:?}: {}", mode, distinct);
        }
    }

    #[test]
    fn fmix_of_zero_is_zero() {
        assert_eq!(fmix64(0), 0);
        assert_ne!(fmix64(1), 1);
    }
}
