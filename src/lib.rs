//! Cuckoo-hashing approximate membership filters with a plain bucket layout and
//! a compressed block layout, built partition by partition in parallel.

pub mod addresser;
pub mod batch;
pub mod bits;
pub mod block;
pub mod config;
pub mod container;
pub mod error;
pub mod eviction;
pub mod filter;
pub mod hasher;
pub mod log;
pub mod partition;
pub mod retry;
pub mod standard;
pub mod task_queue;

pub use config::{FilterConfig, Layout};
pub use error::{FilterError, Result};
pub use filter::{CuckooFilter, Key};
