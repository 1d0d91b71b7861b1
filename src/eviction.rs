//! Cuckoo insertion shared by both containers: try the primary bucket, then
//! the alternate, then kick victims along their alternate addresses for at
//! most `max_kicks` rounds.
//!
//! Eviction is not transactional. When the loop gives up, the last displaced
//! fingerprint is lost and the partition has to be rebuilt.

use log::trace;
use rand::rngs::StdRng;

use crate::{
    addresser::PartitionAddresser,
    batch::{BatchWidth, KeyLocator, Location},
};

/// Mutable bucket storage of one partition.
pub trait Buckets {
    /// Stores `fp` in `bucket` if there is room for it.
    fn try_insert(&mut self, bucket: usize, fp: u64) -> bool;

    /// Makes room for `fp` at `bucket` by displacing a victim, stores `fp`
    /// and returns the victim's bucket and fingerprint.
    fn kick(&mut self, bucket: usize, fp: u64, rng: &mut StdRng) -> (usize, u64);

    /// Records that a fingerprint left `bucket` for its alternate address.
    fn note_overflow(&mut self, _bucket: usize) {}
}

pub struct Evictor<'a, B> {
    pub table: B,
    pub addresser: PartitionAddresser,
    pub max_kicks: usize,
    pub rng: &'a mut StdRng,
}

impl<B: Buckets> Evictor<'_, B> {
    pub fn insert(&mut self, location: Location) -> bool {
        self.insert_or_displace(location).is_none()
    }

    /// Like `insert`, but on failure hands back the fingerprint that no longer
    /// has a slot, with the bucket it was headed for.
    pub fn insert_or_displace(&mut self, location: Location) -> Option<(usize, u64)> {
        let Location {
            primary,
            mut fingerprint,
        } = location;
        if self.table.try_insert(primary, fingerprint) {
            return None;
        }
        self.table.note_overflow(primary);

        let mut bucket = self.addresser.alternate(primary, fingerprint);
        if self.table.try_insert(bucket, fingerprint) {
            return None;
        }

        for _ in 0..self.max_kicks {
            let (victim_bucket, victim) = self.table.kick(bucket, fingerprint, self.rng);
            self.table.note_overflow(victim_bucket);
            bucket = self.addresser.alternate(victim_bucket, victim);
            fingerprint = victim;
            if self.table.try_insert(bucket, fingerprint) {
                return None;
            }
        }
        trace!(
            "eviction gave up after {} kicks at bucket {}",
            self.max_kicks,
            bucket
        );
        Some((bucket, fingerprint))
    }

    /// Inserts `keys` in order and stops at the first failure.
    pub fn insert_all(&mut self, locator: &KeyLocator, width: BatchWidth, keys: &[u64]) -> bool {
        let mut locations = Vec::with_capacity(CHUNK);
        for chunk in keys.chunks(CHUNK) {
            locator.locate_all(width, chunk, &mut locations);
            for &location in &locations {
                if !self.insert(location) {
                    return false;
                }
            }
        }
        true
    }
}

const CHUNK: usize = 1024;

#[cfg(test)]
mod test {
    use super::*;
    use crate::addresser::AddressingMode;
    use rand::SeedableRng;

    /// One slot per bucket, plain vector storage.
    struct Slots(Vec<u64>);

    impl Buckets for Slots {
        fn try_insert(&mut self, bucket: usize, fp: u64) -> bool {
            if self.0[bucket] == 0 {
                self.0[bucket] = fp;
                true
            } else {
                false
            }
        }
        fn kick(&mut self, bucket: usize, fp: u64, _rng: &mut StdRng) -> (usize, u64) {
            (bucket, std::mem::replace(&mut self.0[bucket], fp))
        }
    }

    #[test]
    fn kicks_move_occupants_to_their_alternate() {
        let addresser = PartitionAddresser::new(AddressingMode::Modulo, 64, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut evictor = Evictor {
            table: Slots(vec![0; 64]),
            addresser,
            max_kicks: 100,
            rng: &mut rng,
        };
        let fps: Vec<u64> = (1..=20).collect();
        for &fp in &fps {
            evictor.insert(Location {
                primary: 3,
                fingerprint: fp,
            });
        }
        assert!(evictor.table.0.iter().filter(|&&fp| fp != 0).count() >= 2);
        // every stored fingerprint sits at bucket 3 or its alternate
        for (bucket, &fp) in evictor.table.0.iter().enumerate() {
            if fp != 0 {
                assert!(bucket == 3 || bucket == addresser.alternate(3, fp));
            }
        }
    }

    #[test]
    fn gives_up_after_max_kicks() {
        let addresser = PartitionAddresser::new(AddressingMode::Pow2, 2, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut evictor = Evictor {
            table: Slots(vec![0; 2]),
            addresser,
            max_kicks: 10,
            rng: &mut rng,
        };
        let inserted = (1..=3u64)
            .filter(|&fp| {
                evictor.insert(Location {
                    primary: 0,
                    fingerprint: fp,
                })
            })
            .count();
        assert!(inserted <= 2);
    }
}
