//! The filter as seen by callers: partitioning, storage ownership and dispatch.

use std::marker::PhantomData;

use bitvec::prelude::*;
use log::{debug, warn};
use num_traits::{AsPrimitive, PrimInt, Unsigned};
use rand::rngs::StdRng;

use crate::{
    addresser::{Addresser, PartitionAddresser},
    batch::{BatchWidth, KeyLocator, Location},
    bits::{padded_words, Bits},
    config::FilterConfig,
    container::Container,
    error::{FilterError, Result},
    hasher::Hasher,
    partition::{partition_of, PartitionSet},
    retry::{PartitionJob, RetryWrapper},
    task_queue::WorkerPool,
};

/// Every partition starts on a 64-byte boundary.
pub const PARTITION_ALIGN_BITS: usize = 512;

const QUERY_CHUNK: usize = 256;

/// Fixed-width unsigned keys.
pub trait Key: PrimInt + Unsigned + AsPrimitive<u64> + Send + Sync {}

impl<T: PrimInt + Unsigned + AsPrimitive<u64> + Send + Sync> Key for T {}

pub struct CuckooFilter<K> {
    config: FilterConfig,
    container: Container,
    hasher: Hasher,
    addresser: Addresser,
    seeds: Vec<u64>,
    /// Word offsets of each partition, `n_partitions + 1` entries.
    offsets: Vec<usize>,
    storage: Vec<u64>,
    retry: RetryWrapper,
    workers: WorkerPool,
    n_keys: usize,
    /// Fingerprint displaced by a failed `add`, with the bucket it belongs to.
    stash: Option<(usize, u64)>,
    add_rng: StdRng,
    _key: PhantomData<fn(K)>,
}

impl<K: Key> CuckooFilter<K> {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let container = Container::from_config(&config)?;
        let workers = WorkerPool::new(config.threads)?;
        Ok(CuckooFilter {
            container,
            hasher: Hasher::new(config.hashing, config.seed),
            addresser: Addresser::default(),
            seeds: Vec::new(),
            offsets: vec![0],
            storage: Vec::new(),
            retry: RetryWrapper::new(config.max_retries, config.max_kicks),
            workers,
            n_keys: 0,
            stash: None,
            add_rng: RetryWrapper::rng_for(config.seed, 0),
            _key: PhantomData,
            config,
        })
    }

    /// An empty filter sized for `expected_keys`, ready for `add`.
    pub fn with_capacity(config: FilterConfig, expected_keys: usize) -> Result<Self> {
        let mut filter = Self::new(config)?;
        let n = filter.config.partitions;
        let per_partition = vec![expected_keys.div_ceil(n); n];
        filter.allocate(&per_partition)?;
        Ok(filter)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Sizes every partition from its key count and zeroes the storage.
    fn allocate(&mut self, histogram: &[usize]) -> Result<()> {
        let requested: Vec<usize> = histogram
            .iter()
            .map(|&keys| self.container.buckets_for(self.config.slots_for(keys)))
            .collect();
        let addresser = Addresser::new(self.config.addressing, &requested)?;

        let mut offsets = Vec::with_capacity(histogram.len() + 1);
        let mut total = 0;
        offsets.push(total);
        for p in 0..histogram.len() {
            let bits = self.container.storage_bits(addresser.size(p));
            total += padded_words(bits, PARTITION_ALIGN_BITS);
            offsets.push(total);
        }

        self.storage.clear();
        self.storage.resize(total, 0);
        self.addresser = addresser;
        self.offsets = offsets;
        self.seeds = vec![self.config.seed; histogram.len()];
        self.stash = None;
        self.n_keys = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.storage = Vec::new();
        self.addresser = Addresser::default();
        self.offsets = vec![0];
        self.seeds.clear();
        self.stash = None;
        self.n_keys = 0;
    }

    pub fn partition_count(&self) -> usize {
        self.seeds.len()
    }

    /// Buckets addressed by partition `partition`.
    pub fn partition_capacity(&self, partition: usize) -> usize {
        self.addresser.size(partition)
    }

    pub fn partition_seed(&self, partition: usize) -> u64 {
        self.seeds[partition]
    }

    fn locator(&self, partition: usize) -> KeyLocator {
        KeyLocator {
            hasher: self.hasher.reseeded(self.seeds[partition]),
            addresser: self.addresser.partition(partition),
            fingerprint_bits: self.config.fingerprint_bits,
            nonzero_fingerprints: self.container.nonzero_fingerprints(),
        }
    }

    fn bits(&self, partition: usize) -> &Bits {
        self.storage[self.offsets[partition]..self.offsets[partition + 1]].view_bits::<Lsb0>()
    }

    /// Builds the filter from `keys`, replacing any previous content.
    pub fn try_construct(&mut self, keys: &[K]) -> Result<()> {
        let values: Vec<u64> = keys.iter().map(|k| k.as_()).collect();
        let set = PartitionSet::build(&values, self.config.partitions);
        self.allocate(&set.histogram)?;

        let locators: Vec<KeyLocator> = (0..set.n_partitions).map(|p| self.locator(p)).collect();
        let mut rest: &mut [u64] = &mut self.storage;
        let mut jobs = Vec::with_capacity(set.n_partitions);
        for (p, locator) in locators.into_iter().enumerate() {
            let len = self.offsets[p + 1] - self.offsets[p];
            let (words, tail) = std::mem::take(&mut rest).split_at_mut(len);
            rest = tail;
            jobs.push(PartitionJob::new(p, words, set.keys(p), locator));
        }

        let outcome = self
            .retry
            .construct(&self.container, &self.workers, self.config.batch, &mut jobs);
        let seeds: Vec<u64> = jobs.iter().map(|job| job.seed()).collect();
        drop(jobs);

        match outcome {
            Ok(()) => {
                self.seeds = seeds;
                self.n_keys = keys.len();
                debug!(
                    "constructed {} keys in {} partitions, {} bytes, {} retries",
                    self.n_keys,
                    self.partition_count(),
                    self.size(),
                    self.retries()
                );
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    pub fn construct(&mut self, keys: &[K]) -> bool {
        match self.try_construct(keys) {
            Ok(()) => true,
            Err(e) => {
                warn!("construction failed: {}", e);
                false
            }
        }
    }

    /// Inserts a single key. Needs an unpartitioned, scalar filter that has
    /// been sized by `construct` or `with_capacity`.
    pub fn try_add(&mut self, key: K) -> Result<()> {
        if self.config.partitions != 1 || self.config.batch != BatchWidth::Scalar {
            return Err(FilterError::UnsupportedOperation { operation: "add" });
        }
        if self.partition_count() == 0 || self.stash.is_some() {
            return Err(FilterError::CapacityExhausted {
                partition: 0,
                requested: self.n_keys + 1,
            });
        }
        let location = self.locator(0).locate(key.as_());
        let addresser = self.addresser.partition(0);
        let words = &mut self.storage[self.offsets[0]..self.offsets[1]];
        let displaced = self.container.insert(
            words.view_bits_mut::<Lsb0>(),
            addresser,
            location,
            self.config.max_kicks,
            &mut self.add_rng,
        );
        self.n_keys += 1;
        match displaced {
            None => Ok(()),
            Some(orphan) => {
                // every fingerprint stays findable; the one left over waits in the stash
                self.stash = Some(orphan);
                Err(FilterError::CapacityExhausted {
                    partition: 0,
                    requested: self.n_keys,
                })
            }
        }
    }

    pub fn add(&mut self, key: K) -> bool {
        self.try_add(key).is_ok()
    }

    #[inline]
    pub fn contains(&self, key: K) -> bool {
        let key = key.as_();
        self.contains_raw(key, partition_of(key, self.partition_count()))
    }

    /// Looks `key` up in a given partition.
    pub fn contains_in(&self, key: K, partition: usize) -> bool {
        self.contains_raw(key.as_(), partition)
    }

    #[inline]
    fn contains_raw(&self, key: u64, partition: usize) -> bool {
        if partition >= self.partition_count() {
            return false;
        }
        let locator = self.locator(partition);
        self.probe(partition, &locator.addresser, locator.locate(key))
    }

    #[inline]
    fn probe(&self, partition: usize, addresser: &PartitionAddresser, location: Location) -> bool {
        self.container.contains(self.bits(partition), addresser, location)
            || self.stash.is_some_and(|(bucket, fp)| {
                fp == location.fingerprint
                    && (bucket == location.primary
                        || bucket == addresser.alternate(location.primary, fp))
            })
    }

    /// Writes `contains(keys[i])` to `out[i]`.
    pub fn contains_batch(&self, keys: &[K], out: &mut [bool]) {
        debug_assert_eq!(keys.len(), out.len());
        if self.partition_count() != 1 {
            for (key, hit) in keys.iter().zip(out.iter_mut()) {
                *hit = self.contains(*key);
            }
            return;
        }
        let locator = self.locator(0);
        let mut values = Vec::with_capacity(QUERY_CHUNK);
        let mut locations = Vec::with_capacity(QUERY_CHUNK);
        for (keys, out) in keys.chunks(QUERY_CHUNK).zip(out.chunks_mut(QUERY_CHUNK)) {
            values.clear();
            values.extend(keys.iter().map(|k| k.as_()));
            locator.locate_all(self.config.batch, &values, &mut locations);
            for (hit, &location) in out.iter_mut().zip(&locations) {
                *hit = self.probe(0, &locator.addresser, location);
            }
        }
    }

    fn count_serial(&self, keys: &[K]) -> usize {
        let mut hits = [false; QUERY_CHUNK];
        keys.chunks(QUERY_CHUNK)
            .map(|chunk| {
                let hits = &mut hits[..chunk.len()];
                self.contains_batch(chunk, hits);
                hits.iter().filter(|&&hit| hit).count()
            })
            .sum()
    }

    /// Number of `keys` the filter reports as members.
    pub fn count(&self, keys: &[K]) -> usize {
        let tasks = self.workers.n_tasks_per_level();
        if tasks == 1 || keys.len() < tasks * QUERY_CHUNK {
            return self.count_serial(keys);
        }
        let chunk = keys.len().div_ceil(tasks);
        let mut partial = vec![0usize; tasks];
        let mut queue = self.workers.queue();
        for (keys, count) in keys.chunks(chunk).zip(partial.iter_mut()) {
            queue.add_task(move || *count = self.count_serial(keys));
        }
        queue.execute_tasks();
        partial.iter().sum()
    }

    /// Bytes of fingerprint storage.
    pub fn size(&self) -> usize {
        self.storage.len() * std::mem::size_of::<u64>()
    }

    /// Average bytes per partition.
    pub fn avg_size(&self) -> usize {
        match self.partition_count() {
            0 => 0,
            n => self.size() / n,
        }
    }

    pub fn retries(&self) -> usize {
        self.retry.retries()
    }

    /// Keys inserted by the last construction plus later `add`s.
    pub fn len(&self) -> usize {
        self.n_keys
    }

    pub fn is_empty(&self) -> bool {
        self.n_keys == 0
    }

    /// Stored fingerprints over slot capacity.
    pub fn load(&self) -> f64 {
        let (used, slots) = (0..self.partition_count()).fold((0, 0), |(used, slots), p| {
            let buckets = self.addresser.size(p);
            (
                used + self.container.occupancy(self.bits(p), buckets),
                slots + self.container.slot_capacity(buckets),
            )
        });
        if slots == 0 {
            0.0
        } else {
            used as f64 / slots as f64
        }
    }

    /// Checks the packing invariants of every block; always fine for the standard layout.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if let Container::Block(layout) = &self.container {
            for p in 0..self.partition_count() {
                layout
                    .check_invariants(self.bits(p), self.addresser.size(p))
                    .map_err(|e| format!("partition {}: {}", p, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{addresser::AddressingMode, config::Layout, hasher::HashMode, log::init_test_logger};
    use rand::{Rng, SeedableRng};

    fn random_keys(n: usize, seed: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.random()).collect()
    }

    fn block_config() -> FilterConfig {
        FilterConfig {
            layout: Layout::block(),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn no_false_negatives_across_configurations() {
        init_test_logger();
        let keys = random_keys(20_000, 1);
        let layouts = [
            Layout::Standard,
            Layout::block(),
            Layout::Block {
                block_bits: 512,
                buckets_per_block: None,
                overflow_tracking: false,
            },
        ];
        for layout in layouts {
            for addressing in [
                AddressingMode::Pow2,
                AddressingMode::Lemire,
                AddressingMode::Modulo,
            ] {
                for (partitions, threads, batch) in
                    [(1, 1, BatchWidth::Scalar), (8, 4, BatchWidth::X8), (3, 2, BatchWidth::X16)]
                {
                    let config = FilterConfig {
                        layout,
                        addressing,
                        partitions,
                        threads,
                        batch,
                        ..FilterConfig::default()
                    };
                    let mut filter = CuckooFilter::<u64>::new(config.clone()).unwrap();
                    assert!(filter.construct(&keys), "{:?}", config);
                    assert_eq!(filter.count(&keys), keys.len(), "{:?}", config);
                    assert!(keys.iter().all(|&k| filter.contains(k)));
                    assert_eq!(filter.check_invariants(), Ok(()));
                }
            }
        }
    }

    #[test]
    fn every_hash_mode_builds() {
        let keys: Vec<u64> = (0..10_000).collect();
        for hashing in [HashMode::Murmur3, HashMode::Multiplicative, HashMode::Fmix] {
            let mut filter = CuckooFilter::<u64>::new(FilterConfig {
                hashing,
                ..FilterConfig::default()
            })
            .unwrap();
            assert!(filter.construct(&keys), "{:?}", hashing);
            assert_eq!(filter.count(&keys), keys.len());
        }
    }

    #[test]
    fn small_unpartitioned_filter_needs_no_retry() {
        for seed in 0..20u64 {
            for layout in [Layout::Standard, Layout::block()] {
                let config = FilterConfig {
                    associativity: 2,
                    fingerprint_bits: 12,
                    layout,
                    load_factor: 115,
                    seed,
                    ..FilterConfig::default()
                };
                let keys = random_keys(1000, seed);
                let mut filter = CuckooFilter::<u64>::new(config).unwrap();
                assert!(filter.construct(&keys), "seed {} {:?}", seed, layout);
                assert_eq!(filter.retries(), 0, "seed {} {:?}", seed, layout);
                assert_eq!(filter.count(&keys), 1000);
            }
        }
    }

    /// A standard-layout lookup hits when a stored fingerprint shares its
    /// bucket pair, wherever eviction left it. Without rebuilds the count is
    /// fixed by the hashes and table sizes.
    #[test]
    fn scaled_lookup_scenario() {
        init_test_logger();
        let n = 100_000;
        let keys = random_keys(n, 3);
        let mut superset = keys.clone();
        superset.extend(random_keys(10 * n, 4));
        let partitioned = FilterConfig {
            addressing: AddressingMode::Lemire,
            partitions: 8,
            ..FilterConfig::default()
        };
        let recorded = [
            (FilterConfig::default(), 23_815),
            (
                FilterConfig {
                    threads: 4,
                    batch: BatchWidth::X8,
                    ..partitioned.clone()
                },
                26_890,
            ),
            (
                FilterConfig {
                    batch: BatchWidth::X16,
                    ..partitioned
                },
                26_890,
            ),
        ];
        for (config, false_positives) in recorded {
            let mut filter = CuckooFilter::<u64>::new(config.clone()).unwrap();
            assert!(filter.construct(&keys));
            assert_eq!(filter.retries(), 0, "{:?}", config);
            assert_eq!(filter.count(&keys), n);
            assert_eq!(filter.count(&superset) - n, false_positives, "{:?}", config);
        }

        let mut block = CuckooFilter::<u64>::new(block_config()).unwrap();
        assert!(block.construct(&keys));
        assert_eq!(block.count(&keys), n);
        // about 2 * A / 2^k at this load
        assert!(block.count(&superset) - n < superset.len() / 25);
    }

    #[test]
    fn false_positives_are_reproducible() {
        let keys = random_keys(30_000, 5);
        let lookups = random_keys(300_000, 6);
        let count_with = |threads: usize| {
            let mut filter = CuckooFilter::<u64>::new(FilterConfig {
                partitions: 8,
                threads,
                batch: BatchWidth::X4,
                ..block_config()
            })
            .unwrap();
            assert!(filter.construct(&keys));
            (filter.count(&lookups), filter.size(), filter.partition_seed(7))
        };
        let serial = count_with(1);
        assert_eq!(count_with(4), serial);
        assert_eq!(count_with(4), serial);
    }

    #[test]
    #[ignore = "one million keys, run with --ignored"]
    fn million_key_scenario() {
        let n = 1_000_000;
        let keys = random_keys(n, 7);
        let mut superset = keys.clone();
        superset.extend(random_keys(10 * n, 8));
        let config = FilterConfig {
            associativity: 4,
            fingerprint_bits: 8,
            addressing: AddressingMode::Lemire,
            load_factor: 115,
            partitions: 64,
            threads: 8,
            batch: BatchWidth::X8,
            ..FilterConfig::default()
        };
        let mut filter = CuckooFilter::<u64>::new(config).unwrap();
        assert!(filter.construct(&keys));
        assert_eq!(filter.retries(), 0);
        assert_eq!(filter.count(&keys), n);
        assert_eq!(filter.count(&superset) - n, 269_463);
    }

    #[test]
    fn exhausted_retries_leave_nothing_behind() {
        init_test_logger();
        let config = FilterConfig {
            addressing: AddressingMode::Lemire,
            max_kicks: 0,
            max_retries: 2,
            load_factor: 100,
            ..FilterConfig::default()
        };
        let keys = random_keys(5_000, 9);
        let mut filter = CuckooFilter::<u64>::new(config).unwrap();
        assert!(matches!(
            filter.try_construct(&keys),
            Err(FilterError::ConstructionFailure { partition: 0, attempts: 2 })
        ));
        assert_eq!(filter.retries(), 2);
        assert_eq!(filter.partition_count(), 0);
        assert_eq!(filter.size(), 0);
        assert!(!filter.contains(keys[0]));
        assert!(!filter.construct(&keys));
        assert_eq!(filter.retries(), 4);
    }

    #[test]
    fn add_after_with_capacity() {
        let mut filter =
            CuckooFilter::<u32>::with_capacity(FilterConfig::default(), 1_000).unwrap();
        assert!(filter.is_empty());
        for key in 0..1_000u32 {
            assert!(filter.add(key));
        }
        assert_eq!(filter.len(), 1_000);
        assert!((0..1_000u32).all(|k| filter.contains(k)));
    }

    #[test]
    fn add_extends_a_constructed_filter() {
        let keys: Vec<u64> = (0..500).collect();
        let mut filter = CuckooFilter::<u64>::new(FilterConfig {
            load_factor: 200,
            ..block_config()
        })
        .unwrap();
        assert!(filter.construct(&keys));
        for key in 500..700u64 {
            assert!(filter.add(key));
        }
        assert!((0..700u64).all(|k| filter.contains(k)));
        assert_eq!(filter.check_invariants(), Ok(()));
    }

    #[test]
    fn overfull_add_keeps_every_key() {
        let mut filter = CuckooFilter::<u64>::with_capacity(
            FilterConfig {
                max_kicks: 20,
                ..FilterConfig::default()
            },
            100,
        )
        .unwrap();
        let mut added = Vec::new();
        for key in 0..1_000u64 {
            match filter.try_add(key) {
                Ok(()) => added.push(key),
                Err(FilterError::CapacityExhausted { .. }) => {
                    added.push(key);
                    break;
                }
                Err(e) => panic!("{}", e),
            }
        }
        assert!(added.len() < 1_000);
        assert!(added.iter().all(|&k| filter.contains(k)));
        assert!(!filter.add(5_000));
    }

    #[test]
    fn add_needs_a_plain_filter() {
        let mut partitioned = CuckooFilter::<u64>::with_capacity(
            FilterConfig {
                partitions: 4,
                ..FilterConfig::default()
            },
            100,
        )
        .unwrap();
        assert_eq!(
            partitioned.try_add(1),
            Err(FilterError::UnsupportedOperation { operation: "add" })
        );
        let mut batched = CuckooFilter::<u64>::new(FilterConfig {
            batch: BatchWidth::X4,
            ..FilterConfig::default()
        })
        .unwrap();
        assert!(!batched.add(1));
        let mut unsized_filter = CuckooFilter::<u64>::new(FilterConfig::default()).unwrap();
        assert!(matches!(
            unsized_filter.try_add(1),
            Err(FilterError::CapacityExhausted { .. })
        ));
    }

    #[test]
    fn lookup_by_partition_index() {
        let keys = random_keys(5_000, 10);
        let mut filter = CuckooFilter::<u64>::new(FilterConfig {
            partitions: 5,
            ..FilterConfig::default()
        })
        .unwrap();
        assert!(filter.construct(&keys));
        for &key in &keys[..100] {
            assert!(filter.contains_in(key, partition_of(key, 5)));
        }
        assert!(!filter.contains_in(keys[0], 5));
        let mut hits = vec![false; keys.len()];
        filter.contains_batch(&keys, &mut hits);
        assert!(hits.iter().all(|&hit| hit));
    }

    #[test]
    fn partitions_are_aligned() {
        let keys = random_keys(10_000, 11);
        let mut filter = CuckooFilter::<u64>::new(FilterConfig {
            addressing: AddressingMode::Lemire,
            partitions: 7,
            ..FilterConfig::default()
        })
        .unwrap();
        assert!(filter.construct(&keys));
        assert_eq!(filter.partition_count(), 7);
        for p in 0..7 {
            let words = filter.offsets[p + 1] - filter.offsets[p];
            assert_eq!(words % (PARTITION_ALIGN_BITS / 64), 0);
            assert!(filter.partition_capacity(p) > 0);
        }
        assert_eq!(filter.size() % 64, 0);
        assert_eq!(filter.avg_size(), filter.size() / 7);
        assert!(filter.load() > 0.7 && filter.load() <= 1.0);
    }

    #[test]
    fn empty_input_builds_an_empty_filter() {
        let mut filter = CuckooFilter::<u64>::new(block_config()).unwrap();
        assert!(filter.construct(&[]));
        assert!(filter.is_empty());
        assert_eq!(filter.count(&[1, 2, 3]), 0);
        assert_eq!(filter.load(), 0.0);
    }

    #[test]
    fn invalid_configuration_prevents_instantiation() {
        let config = FilterConfig {
            associativity: 16,
            fingerprint_bits: 8,
            ..FilterConfig::default()
        };
        assert!(matches!(
            CuckooFilter::<u64>::new(config),
            Err(FilterError::InvalidConfiguration { .. })
        ));
    }
}
