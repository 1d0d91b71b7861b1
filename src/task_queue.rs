//! Fixed worker pool and a barrier-separated task queue on top of it.

use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{FilterError, Result};

const TASKS_PER_THREAD: usize = 4;

type Task<'a> = Box<dyn FnOnce() + Send + 'a>;

/// `threads` workers; with a single thread no pool is spawned and every task
/// runs on the caller.
pub struct WorkerPool {
    pool: Option<ThreadPool>,
    n_threads: usize,
}

impl WorkerPool {
    pub fn new(n_threads: usize) -> Result<Self> {
        let n_threads = n_threads.max(1);
        let pool = if n_threads > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .thread_name(|i| format!("amq-worker-{}", i))
                .build()
                .map_err(|e| FilterError::invalid_configuration(e.to_string()))?;
            debug!("started worker pool with {} threads", n_threads);
            Some(pool)
        } else {
            None
        };
        Ok(WorkerPool { pool, n_threads })
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// How many tasks a level should be split into to keep every worker busy.
    pub fn n_tasks_per_level(&self) -> usize {
        if self.n_threads == 1 {
            1
        } else {
            self.n_threads * TASKS_PER_THREAD
        }
    }

    pub fn queue<'a>(&self) -> TaskQueue<'_, 'a> {
        TaskQueue {
            workers: self,
            levels: vec![Vec::new()],
        }
    }
}

/// Tasks between two barriers run concurrently; levels run in order.
pub struct TaskQueue<'p, 'a> {
    workers: &'p WorkerPool,
    levels: Vec<Vec<Task<'a>>>,
}

impl<'a> TaskQueue<'_, 'a> {
    pub fn add_task(&mut self, task: impl FnOnce() + Send + 'a) {
        if let Some(level) = self.levels.last_mut() {
            level.push(Box::new(task));
        }
    }

    pub fn add_barrier(&mut self) {
        if self.levels.last().is_some_and(|level| !level.is_empty()) {
            self.levels.push(Vec::new());
        }
    }

    pub fn n_threads(&self) -> usize {
        self.workers.n_threads()
    }

    pub fn n_tasks_per_level(&self) -> usize {
        self.workers.n_tasks_per_level()
    }

    pub fn execute_tasks(self) {
        for level in self.levels {
            match &self.workers.pool {
                Some(pool) if level.len() > 1 => pool.scope(|s| {
                    for task in level {
                        s.spawn(move |_| task());
                    }
                }),
                _ => level.into_iter().for_each(|task| task()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn levels_run_in_order() {
        for threads in [1, 4] {
            let workers = WorkerPool::new(threads).unwrap();
            let first = AtomicUsize::new(0);
            let seen_by_second = AtomicUsize::new(0);
            let mut queue = workers.queue();
            for _ in 0..8 {
                queue.add_task(|| {
                    first.fetch_add(1, Ordering::SeqCst);
                });
            }
            queue.add_barrier();
            queue.add_task(|| {
                seen_by_second.store(first.load(Ordering::SeqCst), Ordering::SeqCst);
            });
            queue.execute_tasks();
            assert_eq!(first.load(Ordering::SeqCst), 8);
            assert_eq!(seen_by_second.load(Ordering::SeqCst), 8);
        }
    }

    #[test]
    fn tasks_write_disjoint_slices() {
        let workers = WorkerPool::new(3).unwrap();
        assert_eq!(workers.n_threads(), 3);
        assert_eq!(workers.n_tasks_per_level(), 12);
        let mut data = vec![0usize; 100];
        let mut queue = workers.queue();
        for (i, chunk) in data.chunks_mut(10).enumerate() {
            queue.add_task(move || chunk.iter_mut().for_each(|v| *v = i));
        }
        queue.execute_tasks();
        assert_eq!(data[95], 9);
        assert_eq!(data[5], 0);
    }

    #[test]
    fn single_thread_has_no_pool() {
        let workers = WorkerPool::new(1).unwrap();
        assert!(workers.pool.is_none());
        assert_eq!(workers.n_tasks_per_level(), 1);
    }
}
