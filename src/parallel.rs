//! Parallel processing configuration
//!
//! Weight computation and weight application use rayon's current pool. The
//! optional parallel timestep mode additionally needs a pool sized to the
//! configured number of workers.

use crate::errors::{FusionError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;

/// Configuration for parallel processing
#[derive(Debug, Clone, Default)]
pub struct ParallelConfig {
    pub num_threads: Option<usize>,
}

impl ParallelConfig {
    pub fn new(num_threads: Option<usize>) -> Self {
        Self { num_threads }
    }

    /// Use every available CPU core
    pub fn all_cores() -> Self {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
        }
    }

    /// Set up the global rayon pool. Call once, before any parallel work.
    pub fn setup_global_pool(&self) -> Result<()> {
        match self.num_threads {
            Some(num_threads) => {
                ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build_global()
                    .map_err(|e| {
                        FusionError::ThreadPool(format!(
                            "failed to initialize global pool with {num_threads} threads: {e}"
                        ))
                    })?;
                info!(threads = num_threads, "Configured global thread pool");
            }
            None => info!(threads = rayon::current_num_threads(), "Using default thread pool"),
        }
        Ok(())
    }

    /// Build a dedicated pool, e.g. for processing timesteps side by side.
    pub fn build_pool(&self) -> Result<ThreadPool> {
        let threads = self.num_threads.unwrap_or_else(num_cpus::get).max(1);
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("geofuse-worker-{i}"))
            .build()
            .map_err(|e| FusionError::ThreadPool(format!("failed to build pool with {threads} threads: {e}")))
    }

    /// Threads the configuration resolves to
    pub fn effective_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(rayon::current_num_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_pool_has_requested_size() {
        let pool = ParallelConfig::with_threads(3).build_pool().unwrap();
        assert_eq!(pool.current_num_threads(), 3);
        assert_eq!(ParallelConfig::default().num_threads, None);
        assert!(ParallelConfig::all_cores().effective_threads() >= 1);
    }
}
