//! Partition-parallel construction with a scalar fallback.
//!
//! Every partition first gets one batched attempt on the worker pool. A
//! partition that does not fit is cleared and rebuilt key by key with a freshly
//! drawn seed, up to `max_retries` times. Running out of retries fails the
//! whole construction.

use std::sync::atomic::{AtomicUsize, Ordering};

use bitvec::prelude::*;
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    batch::{BatchWidth, KeyLocator},
    container::Container,
    error::{FilterError, Result},
    task_queue::WorkerPool,
};

/// One partition's share of a construction.
pub struct PartitionJob<'a> {
    pub index: usize,
    pub words: &'a mut [u64],
    pub keys: &'a [u64],
    /// Carries the partition's current seed.
    pub locator: KeyLocator,
    built: bool,
    error: Option<FilterError>,
}

impl<'a> PartitionJob<'a> {
    pub fn new(index: usize, words: &'a mut [u64], keys: &'a [u64], locator: KeyLocator) -> Self {
        PartitionJob {
            index,
            words,
            keys,
            locator,
            built: false,
            error: None,
        }
    }

    pub fn seed(&self) -> u64 {
        self.locator.hasher.seed()
    }
}

#[derive(Debug)]
pub struct RetryWrapper {
    max_retries: usize,
    max_kicks: usize,
    retries: AtomicUsize,
}

impl RetryWrapper {
    pub fn new(max_retries: usize, max_kicks: usize) -> Self {
        RetryWrapper {
            max_retries,
            max_kicks,
            retries: AtomicUsize::new(0),
        }
    }

    /// Rebuild attempts made so far, across all partitions and constructions.
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    /// Eviction randomness for a partition, reproducible from its seed.
    pub fn rng_for(seed: u64, partition: usize) -> StdRng {
        StdRng::seed_from_u64(seed.rotate_left(17) ^ partition as u64)
    }

    /// Builds every job; on return each job's locator holds the seed its
    /// partition was finally built with.
    pub fn construct(
        &self,
        container: &Container,
        workers: &WorkerPool,
        width: BatchWidth,
        jobs: &mut [PartitionJob<'_>],
    ) -> Result<()> {
        let mut queue = workers.queue();
        for job in jobs.iter_mut() {
            queue.add_task(move || {
                let built = self.attempt(container, job, width);
                job.built = built;
                if !built {
                    debug!("partition {} failed its first attempt", job.index);
                }
            });
        }
        queue.execute_tasks();

        let mut queue = workers.queue();
        for job in jobs.iter_mut().filter(|job| !job.built) {
            queue.add_task(move || {
                if let Err(e) = self.rebuild(container, job) {
                    job.error = Some(e);
                }
            });
        }
        queue.execute_tasks();

        match jobs.iter_mut().find_map(|job| job.error.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One construction attempt with the job's current seed.
    pub fn attempt(
        &self,
        container: &Container,
        job: &mut PartitionJob<'_>,
        width: BatchWidth,
    ) -> bool {
        let mut rng = Self::rng_for(job.seed(), job.index);
        let bits = job.words.view_bits_mut::<Lsb0>();
        let buckets = job.locator.addresser.size();
        container.construct(bits, &job.locator, width, job.keys, self.max_kicks, &mut rng)
            && container.occupancy(bits, buckets) == job.keys.len()
    }

    /// Clears the partition and reinserts its keys one at a time with a new
    /// seed until they fit.
    pub fn rebuild(&self, container: &Container, job: &mut PartitionJob<'_>) -> Result<()> {
        let mut seeds = StdRng::seed_from_u64(job.seed() ^ job.index as u64);
        for attempt in 1..=self.max_retries {
            self.retries.fetch_add(1, Ordering::Relaxed);
            let seed = seeds.random::<u64>();
            job.locator.hasher = job.locator.hasher.reseeded(seed);
            job.words.fill(0);
            info!(
                "rebuilding partition {} ({} keys), attempt {} with seed {:#x}",
                job.index,
                job.keys.len(),
                attempt,
                seed
            );
            if self.attempt(container, job, BatchWidth::Scalar) {
                job.built = true;
                return Ok(());
            }
        }
        warn!(
            "partition {} did not fit after {} rebuilds",
            job.index, self.max_retries
        );
        Err(FilterError::ConstructionFailure {
            partition: job.index,
            attempts: self.max_retries,
        })
    }
}
