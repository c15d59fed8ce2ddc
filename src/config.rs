//! Runtime configuration for the queue.

use std::num::NonZeroUsize;
use std::thread;

/// Configuration for the queue driver.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of concurrently running jobs.
    pub max_parallel: usize,
    /// Niceness applied to jobs created from a spec.
    pub niceness: i32,
    /// Seconds between reconciliation passes.
    pub interval_secs: u64,
}

/// One slot less than the host's parallelism, leaving a core for the
/// queue and everything else; never below 1.
pub fn default_max_parallel() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            niceness: 0,
            interval_secs: 1,
        }
    }
}
